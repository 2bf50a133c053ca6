//! Precondition and capacity boundaries documented on `Kvs::put`/`get`.

use flashkv::checksum::Crc16;
use flashkv::{Error, Kvs};
use flashkv_flash::Partition;
use flashkv_sim::MemoryFlash;

type SmallIndex = Kvs<MemoryFlash, Crc16, 4, 4, 64, 256, 0x4B56_5331>;
type TestKvs = Kvs<MemoryFlash, Crc16, 64, 4, 512, 1024, 0x4B56_5331>;

fn fresh() -> TestKvs {
    let flash = MemoryFlash::new(4, 1024, 16);
    let partition = Partition::new(flash, 0, 4, 16).unwrap();
    TestKvs::format(partition).unwrap()
}

#[test]
fn empty_key_is_rejected() {
    let mut kvs = fresh();
    assert_eq!(kvs.put(b"", b"v"), Err(Error::InvalidArgument));
}

#[test]
fn max_length_key_is_accepted() {
    let mut kvs = fresh();
    let key = [b'k'; 64];
    kvs.put(&key, b"v").unwrap();
    let mut out = [0u8; 4];
    assert_eq!(kvs.get(&key, &mut out).unwrap().len, 1);
}

#[test]
fn over_length_key_is_rejected() {
    let mut kvs = fresh();
    let key = [b'k'; 65];
    assert_eq!(kvs.put(&key, b"v"), Err(Error::InvalidArgument));
}

#[test]
fn zero_length_value_round_trips() {
    let mut kvs = fresh();
    kvs.put(b"k", b"").unwrap();
    let mut out = [0u8; 4];
    let result = kvs.get(b"k", &mut out).unwrap();
    assert_eq!(result.len, 0);
}

#[test]
fn empty_key_is_rejected_by_delete() {
    let mut kvs = fresh();
    assert_eq!(kvs.delete(b""), Err(Error::InvalidArgument));
}

#[test]
fn over_length_key_is_rejected_by_delete() {
    let mut kvs = fresh();
    let key = [b'k'; 65];
    assert_eq!(kvs.delete(&key), Err(Error::InvalidArgument));
}

#[test]
fn max_length_value_round_trips() {
    let mut kvs = fresh();
    let value = [7u8; 512];
    kvs.put(b"k", &value).unwrap();
    let mut out = [0u8; 512];
    let result = kvs.get(b"k", &mut out).unwrap();
    assert_eq!(result.len, 512);
    assert_eq!(&out[..], &value[..]);
}

#[test]
fn over_length_value_is_rejected() {
    let mut kvs = fresh();
    let value = [7u8; 513];
    assert_eq!(kvs.put(b"k", &value), Err(Error::InvalidArgument));
}

#[test]
fn index_reports_resource_exhausted_once_full() {
    let flash = MemoryFlash::new(4, 1024, 16);
    let partition = Partition::new(flash, 0, 4, 16).unwrap();
    let mut kvs = SmallIndex::format(partition).unwrap();
    for i in 0..4u8 {
        kvs.put(&[i], b"v").unwrap();
    }
    assert_eq!(kvs.put(&[4u8], b"v"), Err(Error::ResourceExhausted));
    assert_eq!(kvs.len(), 4);

    // a fifth distinct key still fails, but overwriting one already held
    // keeps working since it reuses its existing slot
    kvs.put(&[0u8], b"updated").unwrap();
    let mut out = [0u8; 8];
    assert_eq!(&out[..kvs.get(&[0u8], &mut out).unwrap().len], b"updated");
}
