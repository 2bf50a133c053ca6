//! In-RAM bookkeeping for each sector of the partition.
//!
//! Mirrors the shape of the teacher's `cluster_bitmap.rs`: a fixed-size
//! array of lightweight per-unit descriptors, never heap-allocated, with
//! state transitions driven entirely by the engine rather than by the
//! descriptors themselves.

/// Lifecycle state of one sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorState {
    /// Fully erased (every byte `0xFF`). Safe to write from offset 0.
    Erased,
    /// Contains entries appended since the last erase. May still have free
    /// space at the tail, may have zero free space, and may be carrying
    /// reclaimable (superseded or tombstoned) bytes.
    Active,
}

/// Bookkeeping for a single sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorDescriptor {
    pub state: SectorState,
    /// Offset of the first free byte, i.e. where the next append lands.
    pub bytes_written: u32,
    /// Bytes within `0..bytes_written` that belong to entries no longer
    /// reachable from the key index (superseded puts, collected
    /// tombstones). Dead weight a GC pass would recover by erasing.
    pub bytes_reclaimable: u32,
}

impl SectorDescriptor {
    const fn erased() -> Self {
        Self { state: SectorState::Erased, bytes_written: 0, bytes_reclaimable: 0 }
    }
}

/// Fixed-capacity table of per-sector descriptors.
///
/// `N` is the partition's sector count; every sector is tracked, so `N`
/// must equal [`flashkv_flash::Partition::sector_count`].
pub struct SectorTable<const N: usize> {
    sectors: [SectorDescriptor; N],
    sector_size: u32,
}

impl<const N: usize> SectorTable<N> {
    /// A table with every sector marked erased.
    pub fn new(sector_size: u32) -> Self {
        Self { sectors: [SectorDescriptor::erased(); N], sector_size }
    }

    pub fn get(&self, index: usize) -> &SectorDescriptor {
        &self.sectors[index]
    }

    pub fn len(&self) -> usize {
        N
    }

    pub fn is_empty(&self) -> bool {
        N == 0
    }

    pub fn free_bytes(&self, index: usize) -> u32 {
        self.sector_size - self.sectors[index].bytes_written
    }

    /// Record `len` freshly written bytes at the tail of `index`.
    pub fn mark_written(&mut self, index: usize, len: u32) {
        let s = &mut self.sectors[index];
        s.state = SectorState::Active;
        s.bytes_written += len;
        debug_assert!(s.bytes_written <= self.sector_size);
    }

    /// Record `len` bytes within `index` as no longer reachable.
    pub fn mark_reclaimable(&mut self, index: usize, len: u32) {
        let s = &mut self.sectors[index];
        s.bytes_reclaimable += len;
        debug_assert!(s.bytes_reclaimable <= s.bytes_written);
    }

    /// Reset `index` to the erased state after the caller has physically
    /// erased it.
    pub fn mark_erased(&mut self, index: usize) {
        self.sectors[index] = SectorDescriptor::erased();
    }

    /// Mark `index` fully used and fully dead without a known valid
    /// prefix, used by scan recovery when a sector's contents can't be
    /// trusted past some point.
    pub fn mark_corrupt(&mut self, index: usize, valid_prefix: u32) {
        let s = &mut self.sectors[index];
        s.state = SectorState::Active;
        s.bytes_written = self.sector_size;
        s.bytes_reclaimable = self.sector_size - valid_prefix;
    }

    /// Index of an erased sector other than `reserve`, if more than one
    /// exists. Never hands out the last erased sector: the engine always
    /// keeps at least one fully erased sector in reserve as a guaranteed
    /// garbage-collection target.
    pub fn next_erased_excluding_reserve(&self, reserve: Option<usize>) -> Option<usize> {
        let mut found_reserve = false;
        for idx in self.erased_indices() {
            if Some(idx) == reserve && !found_reserve {
                found_reserve = true;
                continue;
            }
            return Some(idx);
        }
        None
    }

    fn erased_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..N).filter(|&i| self.sectors[i].state == SectorState::Erased)
    }

    pub fn erased_count(&self) -> usize {
        self.erased_indices().count()
    }

    /// The sector with the most reclaimable bytes, excluding `exclude`
    /// (normally the currently active write sector, and any already-erased
    /// sector). Ties resolve to the lowest index. Returns `None` if no
    /// sector has any reclaimable bytes.
    pub fn choose_gc_victim(&self, exclude: usize) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for i in 0..N {
            if i == exclude || self.sectors[i].state == SectorState::Erased {
                continue;
            }
            let reclaimable = self.sectors[i].bytes_reclaimable;
            if reclaimable == 0 {
                continue;
            }
            match best {
                Some((_, best_bytes)) if best_bytes >= reclaimable => {}
                _ => best = Some((i, reclaimable)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// Sector with spare capacity, preferring the most-utilized one so
    /// erased sectors stay in reserve as long as possible.
    pub fn most_utilized_with_space(&self, min_free: u32) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for i in 0..N {
            let s = &self.sectors[i];
            if s.state != SectorState::Active {
                continue;
            }
            let free = self.sector_size - s.bytes_written;
            if free < min_free {
                continue;
            }
            match best {
                Some((_, best_written)) if best_written >= s.bytes_written => {}
                _ => best = Some((i, s.bytes_written)),
            }
        }
        best.map(|(i, _)| i)
    }
}
