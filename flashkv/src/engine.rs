//! The key-value store itself: mount/format, put/get/delete, iteration,
//! and the garbage collector that reclaims sectors in the background of a
//! `put`.

use core::marker::PhantomData;

use flashkv_flash::{Flash, Partition};

use crate::checksum::Checksum;
use crate::entry;
use crate::index::{hash_key, KeyDescriptor, KeyIndex};
use crate::sector_table::SectorTable;
use crate::Error;

/// Outcome of [`Kvs::mount`]: whether existing entries were recovered from
/// flash or the partition was found blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// At least one valid entry was replayed from flash.
    Recovered,
    /// The partition was entirely erased; this is equivalent to a fresh
    /// [`Kvs::format`] and no entries exist yet.
    Empty,
}

/// Result of a successful [`Kvs::get`]. `out` was always big enough to hold
/// the whole value; an undersized buffer is [`Error::ResourceExhausted`]
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetResult {
    /// The value's length.
    pub len: usize,
}

/// One entry yielded by [`Kvs::iter`].
#[derive(Debug, Clone, Copy)]
pub struct IterEntry {
    pub key: [u8; entry::KEY_LEN_MAX],
    pub key_len: u8,
    pub value_len: u16,
}

impl IterEntry {
    pub fn key(&self) -> &[u8] {
        &self.key[..self.key_len as usize]
    }
}

/// An embedded key-value store over a raw flash partition.
///
/// - `F`: the underlying [`Flash`] device.
/// - `C`: the [`Checksum`] algorithm entries are encoded with.
/// - `MAX_ENTRIES`: the key index's capacity, live keys plus pending
///   tombstones.
/// - `MAX_SECTORS`: must equal the partition's sector count.
/// - `MAX_VALUE_LEN`: the largest value accepted by `put`.
/// - `MAX_ENTRY_LEN`: the scratch buffer size, must be at least the
///   on-flash size of the largest possible entry (`MAX_VALUE_LEN` plus a
///   64-byte key, header, and alignment padding).
/// - `MAGIC`: a deployment-chosen constant identifying this format dialect;
///   mounting a partition written with a different `MAGIC` is treated as
///   blank space, not as a foreign format to be rejected loudly, since a
///   flash device has no directory to consult first.
pub struct Kvs<
    F: Flash,
    C: Checksum,
    const MAX_ENTRIES: usize,
    const MAX_SECTORS: usize,
    const MAX_VALUE_LEN: usize,
    const MAX_ENTRY_LEN: usize,
    const MAGIC: u32,
> {
    partition: Partition<F>,
    sectors: SectorTable<MAX_SECTORS>,
    index: KeyIndex<MAX_ENTRIES>,
    active_sector: usize,
    next_transaction_id: u32,
    scratch: [u8; MAX_ENTRY_LEN],
    _checksum: PhantomData<C>,
}

impl<
        F: Flash,
        C: Checksum,
        const MAX_ENTRIES: usize,
        const MAX_SECTORS: usize,
        const MAX_VALUE_LEN: usize,
        const MAX_ENTRY_LEN: usize,
        const MAGIC: u32,
    > Kvs<F, C, MAX_ENTRIES, MAX_SECTORS, MAX_VALUE_LEN, MAX_ENTRY_LEN, MAGIC>
{
    /// Erase the whole partition and start from an empty store.
    pub fn format(mut partition: Partition<F>) -> Result<Self, Error<F::Error>> {
        assert_eq!(partition.sector_count() as usize, MAX_SECTORS, "MAX_SECTORS must match the partition");
        let sector_size = partition.sector_size();
        partition.erase(0, partition.sector_count())?;
        Ok(Self {
            partition,
            sectors: SectorTable::new(sector_size),
            index: KeyIndex::new(),
            active_sector: 0,
            next_transaction_id: 1,
            scratch: [0u8; MAX_ENTRY_LEN],
            _checksum: PhantomData,
        })
    }

    /// Rebuild the in-RAM index and sector table by scanning the whole
    /// partition. Safe to call on a never-formatted (freshly erased)
    /// partition: that scans as [`MountOutcome::Empty`].
    pub fn mount(mut partition: Partition<F>) -> Result<(Self, MountOutcome), Error<F::Error>> {
        assert_eq!(partition.sector_count() as usize, MAX_SECTORS, "MAX_SECTORS must match the partition");
        let sector_size = partition.sector_size();
        let alignment = partition.alignment();
        let mut sectors = SectorTable::<MAX_SECTORS>::new(sector_size);
        let mut index = KeyIndex::<MAX_ENTRIES>::new();
        let mut scratch = [0u8; MAX_ENTRY_LEN];
        let mut next_transaction_id: u32 = 1;
        let mut recovered = false;

        for sector_idx in 0..MAX_SECTORS {
            let outcome = scan_sector::<F, C, MAX_ENTRIES, MAX_SECTORS, MAX_VALUE_LEN, MAX_ENTRY_LEN, MAGIC>(
                &mut partition,
                sector_idx,
                sector_size,
                alignment,
                &mut scratch,
                &mut index,
                &mut sectors,
                &mut next_transaction_id,
                &mut recovered,
            )?;
            match outcome {
                ScanOutcome::Blank => {}
                ScanOutcome::EndsClean(len, reclaimable) => {
                    sectors.mark_written(sector_idx, len);
                    sectors.mark_reclaimable(sector_idx, reclaimable);
                }
                ScanOutcome::EndsCorrupt(len, reclaimable) => {
                    log_scan_corruption(sector_idx);
                    sectors.mark_corrupt(sector_idx, len);
                    sectors.mark_reclaimable(sector_idx, reclaimable);
                }
            }
        }

        let active_sector = sectors
            .most_utilized_with_space(1)
            .or_else(|| sectors.next_erased_excluding_reserve(None))
            .unwrap_or(0);

        let outcome = if recovered { MountOutcome::Recovered } else { MountOutcome::Empty };
        Ok((
            Self {
                partition,
                sectors,
                index,
                active_sector,
                next_transaction_id,
                scratch,
                _checksum: PhantomData,
            },
            outcome,
        ))
    }

    /// Number of live keys (tombstones awaiting collection are not
    /// counted).
    pub fn len(&self) -> usize {
        self.index.occupied().filter(|&slot| !self.index.get(slot).unwrap().deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The key index's capacity, live keys plus pending tombstones.
    pub fn max_size(&self) -> usize {
        MAX_ENTRIES
    }

    /// Tear this instance down, handing back the underlying partition so a
    /// caller can hand it to a different device, inspect its raw bytes, or
    /// [`Kvs::mount`] it again. All in-RAM state is discarded; flash is
    /// untouched.
    pub fn into_partition(self) -> Partition<F> {
        self.partition
    }

    /// Mutable access to the backing partition without tearing this
    /// instance down. Meant for test harnesses that need to poke the raw
    /// device underneath an already-mounted store, e.g. to simulate bit
    /// rot in a value this store has already indexed.
    pub fn partition_mut(&mut self) -> &mut Partition<F> {
        &mut self.partition
    }

    fn find_slot(&mut self, key: &[u8]) -> Result<Option<usize>, Error<F::Error>> {
        let hash = hash_key(key);
        for slot in 0..MAX_ENTRIES {
            let Some(descriptor) = self.index.get(slot).copied() else { continue };
            if descriptor.hash != hash {
                continue;
            }
            if self.read_key(&descriptor)? == key {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    fn read_key(&mut self, descriptor: &KeyDescriptor) -> Result<&[u8], Error<F::Error>> {
        let key_len = descriptor.key_len as usize;
        let key_offset = entry::key_offset::<C>();
        let address = self.address_of(descriptor.sector, descriptor.offset);
        self.partition.read(address, &mut self.scratch[..key_offset + key_len])?;
        Ok(&self.scratch[key_offset..key_offset + key_len])
    }

    fn address_of(&self, sector: u16, offset: u32) -> u32 {
        u32::from(sector) * self.partition.sector_size() + offset
    }

    /// Insert or overwrite `key` with `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error<F::Error>> {
        if !(entry::KEY_LEN_MIN..=entry::KEY_LEN_MAX).contains(&key.len()) {
            return Err(Error::InvalidArgument);
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(Error::InvalidArgument);
        }
        self.write_entry(key, value, false)
    }

    /// Remove `key`. Returns [`Error::NotFound`] if it was already absent
    /// or already deleted.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error<F::Error>> {
        if !(entry::KEY_LEN_MIN..=entry::KEY_LEN_MAX).contains(&key.len()) {
            return Err(Error::InvalidArgument);
        }
        let Some(slot) = self.find_slot(key)? else {
            return Err(Error::NotFound);
        };
        if self.index.get(slot).unwrap().deleted {
            return Err(Error::NotFound);
        }
        self.write_entry(key, &[], true)
    }

    fn write_entry(&mut self, key: &[u8], value: &[u8], deleted: bool) -> Result<(), Error<F::Error>> {
        let alignment = self.partition.alignment();
        let encoded_len = entry::encoded_len::<C>(key.len(), value.len(), alignment);
        if encoded_len > MAX_ENTRY_LEN {
            return Err(Error::Internal);
        }
        if self.next_transaction_id == u32::MAX {
            return Err(Error::Internal);
        }

        // Space must be secured before the key lookup below: `ensure_space`
        // may run a GC pass that drops a tombstone slot for this very key,
        // and the slot index returned by `find_slot` would otherwise go
        // stale out from under the rest of this function.
        self.ensure_space(encoded_len as u32)?;
        let existing_slot = self.find_slot(key)?;

        // A brand-new key needs a free index slot. Check before encoding or
        // writing anything: failing after the physical write would leave a
        // fully-written, live-looking orphan entry on flash that a later
        // mount scan could index ahead of a genuinely live key, silently
        // evicting it once the index fills up.
        if existing_slot.is_none() && self.index.len() >= self.index.capacity() {
            return Err(Error::ResourceExhausted);
        }

        let transaction_id = self.next_transaction_id;
        let mut buf = [0u8; MAX_ENTRY_LEN];
        let written = entry::encode::<C>(MAGIC, key, value, transaction_id, deleted, alignment, &mut buf)
            .map_err(|_| Error::Internal)?;
        debug_assert_eq!(written, encoded_len);

        let sector = self.active_sector;
        let offset = self.sectors.get(sector).bytes_written;
        let address = self.address_of(sector as u16, offset);
        self.partition.write(address, &buf[..written])?;
        self.sectors.mark_written(sector, written as u32);

        let descriptor = KeyDescriptor {
            hash: hash_key(key),
            sector: sector as u16,
            offset,
            encoded_len: written as u32,
            key_len: key.len() as u8,
            value_len: value.len() as u16,
            transaction_id,
            deleted,
        };

        if let Some(slot) = existing_slot {
            let old = *self.index.get(slot).unwrap();
            self.sectors.mark_reclaimable(old.sector as usize, old.encoded_len);
            self.index.replace(slot, descriptor);
        } else {
            let inserted = self.index.insert(descriptor);
            debug_assert!(inserted.is_some(), "checked for a free index slot above");
        }

        self.next_transaction_id += 1;
        Ok(())
    }

    /// Read the value for `key` into `out`, returning its true length.
    /// [`Error::ResourceExhausted`] if `out` is too small to hold the whole
    /// value; no partial copy is something a caller should build on, so
    /// this is an error rather than a truncated `Ok`.
    ///
    /// The entry is re-verified against its checksum on every call rather
    /// than trusting the cached index descriptor: the index only proves an
    /// entry was valid when it was last scanned, not that the flash cell
    /// holding it hasn't since bit-rotted. [`Error::DataLoss`] surfaces
    /// that distinction to the caller instead of silently returning
    /// corrupt bytes.
    pub fn get(&mut self, key: &[u8], out: &mut [u8]) -> Result<GetResult, Error<F::Error>> {
        let Some(slot) = self.find_slot(key)? else {
            return Err(Error::NotFound);
        };
        let descriptor = *self.index.get(slot).unwrap();
        if descriptor.deleted {
            return Err(Error::NotFound);
        }

        let alignment = self.partition.alignment();
        let len = descriptor.encoded_len as usize;
        let address = self.address_of(descriptor.sector, descriptor.offset);
        self.partition.read(address, &mut self.scratch[..len])?;
        let (header, _) = entry::decode::<C>(MAGIC, &self.scratch[..len], alignment, MAX_VALUE_LEN)
            .map_err(|_| Error::DataLoss)?;

        let value_len = header.value_length as usize;
        let value_offset = entry::value_offset::<C>(&header);
        let to_read = value_len.min(out.len());
        out[..to_read].copy_from_slice(&self.scratch[value_offset..value_offset + to_read]);
        if out.len() < value_len {
            return Err(Error::ResourceExhausted);
        }
        Ok(GetResult { len: value_len })
    }

    /// Iterate over every live key. Each call to `next` reads from flash;
    /// mutating the store between calls is rejected by the borrow checker,
    /// since the iterator borrows `self` mutably for its whole lifetime.
    pub fn iter(
        &mut self,
    ) -> Iter<'_, F, C, MAX_ENTRIES, MAX_SECTORS, MAX_VALUE_LEN, MAX_ENTRY_LEN, MAGIC> {
        Iter { kvs: self, next_slot: 0 }
    }

    /// Run one garbage-collection pass if any sector has reclaimable
    /// bytes, regardless of whether space pressure currently demands it.
    pub fn collect_garbage(&mut self) -> Result<bool, Error<F::Error>> {
        self.run_gc()
    }

    fn ensure_space(&mut self, needed: u32) -> Result<(), Error<F::Error>> {
        for _ in 0..=MAX_SECTORS {
            if self.sectors.free_bytes(self.active_sector) >= needed {
                return Ok(());
            }
            if let Some(next) = self.sectors.next_erased_excluding_reserve(Some(self.active_sector)) {
                log_sector_rotation(self.active_sector, next);
                self.active_sector = next;
                continue;
            }
            if !self.run_gc()? {
                return Err(Error::ResourceExhausted);
            }
        }
        Err(Error::ResourceExhausted)
    }

    /// Reclaim the sector with the most dead weight, relocating any live
    /// entries it still holds. Returns `false` if no sector had anything
    /// worth reclaiming.
    fn run_gc(&mut self) -> Result<bool, Error<F::Error>> {
        let Some(victim) = self.sectors.choose_gc_victim(self.active_sector) else {
            return Ok(false);
        };
        log_gc_victim(victim, self.sectors.get(victim).bytes_reclaimable);

        // Tombstones pointing at the victim have no other copy once it's
        // erased: drop them from the index outright.
        while let Some(slot) = (0..MAX_ENTRIES).find(|&s| {
            self.index.get(s).is_some_and(|d| d.deleted && d.sector as usize == victim)
        }) {
            self.index.remove(slot);
        }

        // Relocate every live entry still on the victim sector.
        while let Some(slot) = (0..MAX_ENTRIES).find(|&s| {
            self.index.get(s).is_some_and(|d| !d.deleted && d.sector as usize == victim)
        }) {
            let descriptor = *self.index.get(slot).unwrap();
            let target = self.allocate_relocation_target(descriptor.encoded_len, victim)?;
            let src = self.address_of(descriptor.sector, descriptor.offset);
            let dst_offset = self.sectors.get(target).bytes_written;
            let dst = self.address_of(target as u16, dst_offset);

            let len = descriptor.encoded_len as usize;
            let mut buf = [0u8; MAX_ENTRY_LEN];
            self.partition.read(src, &mut buf[..len])?;
            self.partition.write(dst, &buf[..len])?;
            self.sectors.mark_written(target, descriptor.encoded_len);

            let mut moved = descriptor;
            moved.sector = target as u16;
            moved.offset = dst_offset;
            self.index.replace(slot, moved);
        }

        self.partition.erase(victim as u32, 1)?;
        self.sectors.mark_erased(victim);
        log_gc_done(victim);
        if self.active_sector == victim {
            self.active_sector = self.sectors.next_erased_excluding_reserve(None).unwrap_or(victim);
        }
        Ok(true)
    }

    /// Pick a sector to relocate a surviving GC entry into. Never picks
    /// `victim`, and never triggers another GC pass: the entry is still
    /// safely readable on `victim` until the erase a few lines later, so
    /// running out of room here is a plain [`Error::ResourceExhausted`]
    /// rather than a reason to recurse.
    fn allocate_relocation_target(&mut self, needed: u32, victim: usize) -> Result<usize, Error<F::Error>> {
        if self.active_sector != victim && self.sectors.free_bytes(self.active_sector) >= needed {
            return Ok(self.active_sector);
        }
        let target = (0..MAX_SECTORS)
            .find(|&i| i != victim && self.sectors.free_bytes(i) >= needed)
            .ok_or(Error::ResourceExhausted)?;
        log_relocation_target(victim, target);
        Ok(target)
    }
}

/// An iterator over every live key in a [`Kvs`].
pub struct Iter<
    'a,
    F: Flash,
    C: Checksum,
    const MAX_ENTRIES: usize,
    const MAX_SECTORS: usize,
    const MAX_VALUE_LEN: usize,
    const MAX_ENTRY_LEN: usize,
    const MAGIC: u32,
> {
    kvs: &'a mut Kvs<F, C, MAX_ENTRIES, MAX_SECTORS, MAX_VALUE_LEN, MAX_ENTRY_LEN, MAGIC>,
    next_slot: usize,
}

impl<
        'a,
        F: Flash,
        C: Checksum,
        const MAX_ENTRIES: usize,
        const MAX_SECTORS: usize,
        const MAX_VALUE_LEN: usize,
        const MAX_ENTRY_LEN: usize,
        const MAGIC: u32,
    > Iterator for Iter<'a, F, C, MAX_ENTRIES, MAX_SECTORS, MAX_VALUE_LEN, MAX_ENTRY_LEN, MAGIC>
{
    type Item = Result<IterEntry, Error<F::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_slot < MAX_ENTRIES {
            let slot = self.next_slot;
            self.next_slot += 1;
            let Some(descriptor) = self.kvs.index.get(slot).copied() else { continue };
            if descriptor.deleted {
                continue;
            }
            return Some(self.kvs.read_key(&descriptor).map(|key| {
                let mut buf = [0u8; entry::KEY_LEN_MAX];
                buf[..key.len()].copy_from_slice(key);
                IterEntry { key: buf, key_len: descriptor.key_len, value_len: descriptor.value_len }
            }));
        }
        None
    }
}

enum ScanOutcome {
    Blank,
    /// Trusted length, plus bytes within it superseded by a duplicate found
    /// elsewhere during this same mount scan.
    EndsClean(u32, u32),
    EndsCorrupt(u32, u32),
}

/// Sequentially decode entries out of one sector, replaying each into
/// `index` (resolving winners by transaction id) and returning how far
/// into the sector the scan could trust the contents.
///
/// A duplicate key can turn up on either side of a winner comparison:
/// this sector's copy may lose to one already indexed from an
/// earlier-scanned sector (dead right here), or it may beat one already
/// indexed from an earlier sector (dead over there). Only the latter can
/// be marked reclaimable immediately, since the losing sector has already
/// finished its own scan; the former is accumulated in `reclaimable` and
/// applied once this sector's own `bytes_written` is known.
#[allow(clippy::too_many_arguments)]
fn scan_sector<
    F: Flash,
    C: Checksum,
    const MAX_ENTRIES: usize,
    const MAX_SECTORS: usize,
    const MAX_VALUE_LEN: usize,
    const MAX_ENTRY_LEN: usize,
    const MAGIC: u32,
>(
    partition: &mut Partition<F>,
    sector_idx: usize,
    sector_size: u32,
    alignment: u32,
    scratch: &mut [u8; MAX_ENTRY_LEN],
    index: &mut KeyIndex<MAX_ENTRIES>,
    sectors: &mut SectorTable<MAX_SECTORS>,
    next_transaction_id: &mut u32,
    recovered: &mut bool,
) -> Result<ScanOutcome, Error<F::Error>> {
    let key_offset = entry::key_offset::<C>();
    let mut offset: u32 = 0;
    let mut reclaimable: u32 = 0;
    loop {
        let remaining = sector_size - offset;
        if (remaining as usize) < entry::header_len::<C>() {
            return Ok(ScanOutcome::EndsClean(offset, reclaimable));
        }
        let window = remaining.min(MAX_ENTRY_LEN as u32) as usize;
        let address = sector_idx as u32 * sector_size + offset;
        partition.read(address, &mut scratch[..window])?;

        if entry::is_all_erased(&scratch[..window]) {
            return if offset == 0 {
                Ok(ScanOutcome::Blank)
            } else {
                Ok(ScanOutcome::EndsClean(offset, reclaimable))
            };
        }

        match entry::decode::<C>(MAGIC, &scratch[..window], alignment, MAX_VALUE_LEN) {
            Ok((header, len)) => {
                *recovered = true;
                let key = &scratch[key_offset..key_offset + header.key_length as usize];
                let hash = hash_key(key);

                let winner_slot = resolve_scan_winner(partition, index, hash, key, sector_size, key_offset)?;
                let descriptor = KeyDescriptor {
                    hash,
                    sector: sector_idx as u16,
                    offset,
                    encoded_len: len as u32,
                    key_len: header.key_length,
                    value_len: header.value_length,
                    transaction_id: header.transaction_id,
                    deleted: header.deleted,
                };
                match winner_slot {
                    None => {
                        let _ = index.insert(descriptor);
                    }
                    Some(slot) => {
                        let existing = *index.get(slot).unwrap();
                        if header.transaction_id > existing.transaction_id {
                            if existing.sector as usize == sector_idx {
                                reclaimable += existing.encoded_len;
                            } else {
                                sectors.mark_reclaimable(existing.sector as usize, existing.encoded_len);
                            }
                            index.replace(slot, descriptor);
                        } else {
                            // This sector's copy is the older one; it is
                            // always dead weight on sector_idx itself.
                            reclaimable += len as u32;
                        }
                    }
                }

                if header.transaction_id >= *next_transaction_id {
                    *next_transaction_id = header.transaction_id + 1;
                }
                offset += len as u32;
            }
            Err(_) => return Ok(ScanOutcome::EndsCorrupt(offset, reclaimable)),
        }
    }
}

/// Find the index slot (if any) already holding the same key as the one
/// currently in `scratch` at `key_offset`, disambiguating hash collisions
/// by re-reading each candidate's key bytes from flash.
fn resolve_scan_winner<F: Flash, const MAX_ENTRIES: usize>(
    partition: &mut Partition<F>,
    index: &KeyIndex<MAX_ENTRIES>,
    hash: u32,
    current_key: &[u8],
    sector_size: u32,
    key_offset: usize,
) -> Result<Option<usize>, Error<F::Error>> {
    let mut candidate_key = [0u8; entry::KEY_LEN_MAX];
    for slot in 0..MAX_ENTRIES {
        let Some(candidate) = index.get(slot).copied() else { continue };
        if candidate.hash != hash || candidate.key_len as usize != current_key.len() {
            continue;
        }
        let address = u32::from(candidate.sector) * sector_size + candidate.offset + key_offset as u32;
        let len = candidate.key_len as usize;
        partition.read(address, &mut candidate_key[..len])?;
        if &candidate_key[..len] == current_key {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

fn log_sector_rotation(_from: usize, _to: usize) {
    #[cfg(feature = "log")]
    log::trace!("active sector full, rotating {_from} -> {_to}");
}

fn log_gc_victim(_victim: usize, _reclaimable: u32) {
    #[cfg(feature = "log")]
    log::debug!("gc: reclaiming sector {_victim} ({_reclaimable} dead bytes)");
}

fn log_relocation_target(_victim: usize, _target: usize) {
    #[cfg(feature = "log")]
    log::trace!("gc: relocating a live entry off sector {_victim} onto sector {_target}");
}

fn log_gc_done(_victim: usize) {
    #[cfg(feature = "log")]
    log::debug!("gc: sector {_victim} erased");
}

fn log_scan_corruption(_sector_idx: usize) {
    #[cfg(feature = "log")]
    log::warn!("sector {_sector_idx} truncated at a corrupt or incomplete entry during mount");
}
