//! Simulates power loss at every possible byte offset of a write and
//! checks that a remount afterward never observes a half-written entry:
//! only a fully absent write or a fully completed one.

use flashkv::checksum::Crc16;
use flashkv::Kvs;
use flashkv_flash::Partition;
use flashkv_sim::{FaultInjectingFlash, MemoryFlash};

const SECTOR_SIZE: u32 = 128;
const SECTORS: u32 = 4;
const ALIGNMENT: u32 = 16;

type PlainKvs = Kvs<MemoryFlash, Crc16, 4, 4, 32, 64, 0x4B56_5331>;
type FaultKvs = Kvs<FaultInjectingFlash<MemoryFlash>, Crc16, 4, 4, 32, 64, 0x4B56_5331>;

fn mount_plain(bytes: Vec<u8>) -> PlainKvs {
    let flash = MemoryFlash::from_bytes(bytes, SECTOR_SIZE, ALIGNMENT);
    let partition = Partition::new(flash, 0, SECTORS, ALIGNMENT).unwrap();
    PlainKvs::mount(partition).unwrap().0
}

/// Rewrap a plain device's current raw bytes into a freshly faulted
/// device, armed for `budget` more bytes. Used to keep earlier, intended
/// writes (e.g. an initial `format`/`put` baseline) off the fault budget:
/// only whatever happens *after* this call is at risk of truncation.
fn rewrap_with_fault(
    mut plain: Partition<MemoryFlash>,
    budget: u32,
) -> Partition<FaultInjectingFlash<MemoryFlash>> {
    let mut bytes = vec![0u8; plain.size() as usize];
    plain.read(0, &mut bytes).unwrap();
    let flash = MemoryFlash::from_bytes(bytes, SECTOR_SIZE, ALIGNMENT);
    let mut fault_flash = FaultInjectingFlash::new(flash);
    fault_flash.arm(budget);
    Partition::new(fault_flash, 0, SECTORS, ALIGNMENT).unwrap()
}

/// On a blank device, crash the first-ever write at `budget` bytes and
/// check the remounted store has either nothing or the complete value.
fn first_write_crash_at(budget: u32) {
    let baseline_bytes = {
        let flash = MemoryFlash::new(SECTORS, SECTOR_SIZE, ALIGNMENT);
        let partition = Partition::new(flash, 0, SECTORS, ALIGNMENT).unwrap();
        let kvs = PlainKvs::format(partition).unwrap();
        kvs.into_partition().into_inner().into_bytes()
    };

    let flash = MemoryFlash::from_bytes(baseline_bytes, SECTOR_SIZE, ALIGNMENT);
    let partition = Partition::new(flash, 0, SECTORS, ALIGNMENT).unwrap();
    let fault_partition = rewrap_with_fault(partition, budget);
    let (mut kvs, _) = FaultKvs::mount(fault_partition).unwrap();
    let _ = kvs.put(b"k", b"hello world!!!!!");

    let raw = kvs.into_partition().into_inner().into_inner().into_bytes();
    let mut kvs2 = mount_plain(raw);
    let mut out = [0u8; 32];
    match kvs2.get(b"k", &mut out) {
        Ok(result) => {
            assert_eq!(result.len, 17, "budget {budget}: a recovered value must be the whole value");
            assert_eq!(
                &out[..17],
                b"hello world!!!!!",
                "budget {budget}: recovered garbage instead of the real value"
            );
        }
        Err(flashkv::Error::NotFound) => {}
        Err(e) => panic!("budget {budget}: unexpected error {e:?}"),
    }
}

/// With one valid copy already on flash, crash an overwrite at `budget`
/// bytes and check the remounted store still has either the old or the
/// new value, never a mix.
fn overwrite_crash_at(budget: u32) {
    let baseline_bytes = {
        let flash = MemoryFlash::new(SECTORS, SECTOR_SIZE, ALIGNMENT);
        let partition = Partition::new(flash, 0, SECTORS, ALIGNMENT).unwrap();
        let mut kvs = PlainKvs::format(partition).unwrap();
        kvs.put(b"k", b"old-value").unwrap();
        kvs.into_partition().into_inner().into_bytes()
    };

    let flash = MemoryFlash::from_bytes(baseline_bytes, SECTOR_SIZE, ALIGNMENT);
    let partition = Partition::new(flash, 0, SECTORS, ALIGNMENT).unwrap();
    let fault_partition = rewrap_with_fault(partition, budget);
    let (mut kvs, _) = FaultKvs::mount(fault_partition).unwrap();
    let _ = kvs.put(b"k", b"hello world!!!!!");

    let raw = kvs.into_partition().into_inner().into_inner().into_bytes();
    let mut kvs2 = mount_plain(raw);
    let mut out = [0u8; 32];
    let result = kvs2.get(b"k", &mut out).unwrap_or_else(|e| {
        panic!(
            "budget {budget}: key must survive an overwrite crash (at worst, reverting to the old value), got {e:?}"
        )
    });
    match result.len {
        9 => assert_eq!(&out[..9], b"old-value"),
        17 => assert_eq!(&out[..17], b"hello world!!!!!"),
        other => panic!("budget {budget}: recovered a value of impossible length {other}"),
    }
}

// An entry here (header + 1-byte key + up to 17-byte value, rounded to
// 16-byte alignment) is at most 48 bytes; a budget past that never
// truncates anything, but is harmless to include.
const MAX_BUDGET: u32 = 48;

#[test]
fn first_write_survives_a_crash_at_every_byte_offset() {
    for budget in 0..=MAX_BUDGET {
        first_write_crash_at(budget);
    }
}

#[test]
fn overwrite_survives_a_crash_at_every_byte_offset() {
    for budget in 0..=MAX_BUDGET {
        overwrite_crash_at(budget);
    }
}

// A separate, tighter device that forces `ensure_space` all the way into a
// real `run_gc` pass: every sector full, the chosen victim holding one live
// survivor that must be relocated before the victim can be erased. This is
// the scenario `first_write_crash_at`/`overwrite_crash_at` above never
// reach, since neither ever exhausts every erased sector.
mod gc_relocation {
    use super::*;

    const GC_SECTOR_SIZE: u32 = 64;
    const GC_SECTORS: u32 = 4;
    const GC_ALIGNMENT: u32 = 16;

    // 8-byte keys, 4 sectors, 16-byte values, 32-byte entries: a 1-byte
    // key plus a 1-byte value is a 16-byte entry; a 1-byte key plus a
    // 3-byte value is a 32-byte entry.
    type PlainKvs = Kvs<MemoryFlash, Crc16, 8, 4, 8, 32, 0x4B56_5331>;
    type FaultKvs = Kvs<FaultInjectingFlash<MemoryFlash>, Crc16, 8, 4, 8, 32, 0x4B56_5331>;

    /// Fill the store so every sector has been written at least once (no
    /// sector left `Erased`), sector 0 ends up mostly-dead with "d" as its
    /// sole live survivor, and the active sector has only 16 bytes free —
    /// just enough to relocate "d" into, but not enough for a fresh
    /// 32-byte entry. This drives the next write that needs 32 bytes
    /// straight into `run_gc`.
    fn baseline_bytes() -> Vec<u8> {
        let flash = MemoryFlash::new(GC_SECTORS, GC_SECTOR_SIZE, GC_ALIGNMENT);
        let partition = Partition::new(flash, 0, GC_SECTORS, GC_ALIGNMENT).unwrap();
        let mut kvs = PlainKvs::format(partition).unwrap();

        kvs.put(b"a", b"A").unwrap(); // sector 0
        kvs.put(b"b", b"B").unwrap(); // sector 0
        kvs.put(b"c", b"C").unwrap(); // sector 0
        kvs.put(b"d", b"D").unwrap(); // sector 0, fills it
        kvs.put(b"e", b"E").unwrap(); // rotates to sector 1
        kvs.put(b"a", b"A").unwrap(); // sector 1; sector 0's old "a" now dead
        kvs.put(b"b", b"B").unwrap(); // sector 1; sector 0's old "b" now dead
        kvs.put(b"c", b"C").unwrap(); // sector 1, fills it; sector 0's old "c" now dead
        kvs.put(b"f", b"F").unwrap(); // rotates to sector 2
        kvs.put(b"g", b"G").unwrap(); // sector 2
        kvs.put(b"h", b"H").unwrap(); // sector 2, fills it
        kvs.put(b"e", b"E").unwrap(); // sector 2, fills it; sector 1's old "e" now dead
        kvs.put(b"f", b"F").unwrap(); // rotates to sector 3; sector 2's old "f" now dead
        kvs.put(b"g", b"G").unwrap(); // sector 3; sector 2's old "g" now dead
        kvs.put(b"b", b"B").unwrap(); // sector 3, leaves it 16 bytes free; sector 1's old "b" now dead

        // Sector 0 is now 48/64 dead, holding only "d" live; sectors 1 and
        // 2 are mixed but less reclaimable; sector 3 is active with 16
        // bytes free and no sector left in the `Erased` state.
        kvs.into_partition().into_inner().into_bytes()
    }

    fn rewrap_with_fault(bytes: Vec<u8>, budget: u32) -> Partition<FaultInjectingFlash<MemoryFlash>> {
        let flash = MemoryFlash::from_bytes(bytes, GC_SECTOR_SIZE, GC_ALIGNMENT);
        let mut fault_flash = FaultInjectingFlash::new(flash);
        fault_flash.arm(budget);
        Partition::new(fault_flash, 0, GC_SECTORS, GC_ALIGNMENT).unwrap()
    }

    /// Overwriting "d" with a 32-byte value needs more room than the
    /// active sector has free, and every sector is non-erased, so this
    /// forces a real `run_gc` pass: sector 0 (the most dead) is chosen as
    /// victim, its one live survivor ("d") is relocated onto the active
    /// sector, sector 0 is erased, and only then does the new "d" land.
    /// Crashing at every byte offset of that sequence must always recover
    /// to either the pre-relocation "d" or the fully-written new one —
    /// and must never disturb any of the other seven keys, none of whose
    /// storage this operation ever touches.
    fn crash_during_gc_relocation_at(budget: u32) {
        let bytes = baseline_bytes();
        let fault_partition = rewrap_with_fault(bytes, budget);
        let (mut kvs, _) = FaultKvs::mount(fault_partition).unwrap();
        let _ = kvs.put(b"d", b"NEW");

        let raw = kvs.into_partition().into_inner().into_inner().into_bytes();
        let flash = MemoryFlash::from_bytes(raw, GC_SECTOR_SIZE, GC_ALIGNMENT);
        let partition = Partition::new(flash, 0, GC_SECTORS, GC_ALIGNMENT).unwrap();
        let (mut kvs2, _) = PlainKvs::mount(partition).unwrap();

        let mut out = [0u8; 8];
        let result = kvs2.get(b"d", &mut out).unwrap_or_else(|e| {
            panic!("budget {budget}: \"d\" must survive a crash during GC relocation, got {e:?}")
        });
        match result.len {
            1 => assert_eq!(&out[..1], b"D", "budget {budget}: reverted to a corrupted old value"),
            3 => assert_eq!(&out[..3], b"NEW", "budget {budget}: completed to a corrupted new value"),
            other => panic!("budget {budget}: recovered a value of impossible length {other}"),
        }

        for (key, value) in [(b"a", b'A'), (b"b", b'B'), (b"c", b'C'), (b"e", b'E'), (b"f", b'F'), (b"g", b'G'), (b"h", b'H')] {
            let mut out = [0u8; 8];
            let result = kvs2
                .get(key, &mut out)
                .unwrap_or_else(|e| panic!("budget {budget}: key {key:?} must be untouched by GC elsewhere, got {e:?}"));
            assert_eq!(result.len, 1);
            assert_eq!(out[0], value, "budget {budget}: key {key:?} lost its value");
        }
    }

    // The longest single write in this sequence is the final 32-byte
    // entry; the whole relocate-erase-write sequence is at most
    // 16 (relocation copy) + 64 (sector erase) + 32 (new entry) = 112
    // bytes. Sweep past that with margin.
    const MAX_BUDGET: u32 = 130;

    #[test]
    fn overwrite_survives_a_crash_during_gc_relocation_at_every_byte_offset() {
        for budget in 0..=MAX_BUDGET {
            crash_during_gc_relocation_at(budget);
        }
    }
}
