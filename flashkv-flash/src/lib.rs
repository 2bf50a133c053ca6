//! Flash device and partition abstraction.
//!
//! This crate defines the contract flashkv is written against: a device is a
//! fixed array of equal-size sectors that must be erased before any byte in
//! them can be written, writes must land on alignment boundaries, and erase
//! only ever operates on whole sectors. [`Partition`] carves a contiguous
//! sector range out of a [`Flash`] device so that several independent
//! callers (or test harnesses) can share one physical device.
//!
//! No concrete device driver lives here — only the trait and the partition
//! arithmetic. See `flashkv-sim` for an in-memory test double.

#![cfg_attr(not(feature = "std"), no_std)]

use core::fmt;

/// A device modeled as a fixed array of equal-size sectors.
///
/// Implementors must uphold:
/// - every byte is `0xFF` immediately after [`Flash::erase`] covers it,
/// - [`Flash::write`] only ever succeeds against bytes that are currently
///   `0xFF` (erase-before-write),
/// - [`Flash::erase`] only operates on whole, sector-aligned regions.
///
/// All addresses are byte offsets from the start of the device.
pub trait Flash {
    /// Error type surfaced by the underlying driver (e.g. a hardware bus
    /// fault). Wrapped in [`FlashError::Unknown`] by this trait's methods.
    type Error: fmt::Debug;

    /// Size of one erase unit, in bytes.
    fn sector_size(&self) -> u32;

    /// Number of sectors on the device.
    fn sector_count(&self) -> u32;

    /// Minimum alignment, in bytes, that reads/writes must satisfy. One of
    /// `{1, 2, 4, 8, 16, 32, 64}`.
    fn alignment(&self) -> u32;

    /// Read `buf.len()` bytes starting at `address`.
    ///
    /// Fails [`FlashError::InvalidArgument`] if `address + buf.len()`
    /// exceeds the device size.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError<Self::Error>>;

    /// Write `data` starting at `address`.
    ///
    /// Fails [`FlashError::InvalidArgument`] if `address` or `data.len()` is
    /// not a multiple of [`Flash::alignment`], or the write would run past
    /// the end of the device. Fails [`FlashError::Unknown`] if the target
    /// region is not currently all-`0xFF` (an erase-before-write violation)
    /// or the driver reports a hardware fault.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError<Self::Error>>;

    /// Erase `sector_count` whole sectors starting at `address`.
    ///
    /// Fails [`FlashError::InvalidArgument`] if `address` is not
    /// sector-aligned or the range runs past the end of the device.
    fn erase(&mut self, address: u32, sector_count: u32) -> Result<(), FlashError<Self::Error>>;
}

/// Errors surfaced by [`Flash`] and [`Partition`] operations.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError<E> {
    /// Caller violated a documented precondition (bad alignment, address
    /// out of range).
    InvalidArgument,
    /// The driver reported a hardware-level failure, or a write target
    /// whose bytes were not all `0xFF`.
    Unknown(E),
}

impl<E> FlashError<E> {
    /// Map the driver-specific error payload, keeping `InvalidArgument` as is.
    pub fn map_err<E2>(self, f: impl FnOnce(E) -> E2) -> FlashError<E2> {
        match self {
            FlashError::InvalidArgument => FlashError::InvalidArgument,
            FlashError::Unknown(e) => FlashError::Unknown(f(e)),
        }
    }
}

impl<E: fmt::Debug> fmt::Display for FlashError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::InvalidArgument => write!(f, "invalid argument to flash operation"),
            FlashError::Unknown(e) => write!(f, "flash driver error: {e:?}"),
        }
    }
}

#[cfg(feature = "std")]
impl<E: fmt::Debug> std::error::Error for FlashError<E> {}

/// A contiguous sector range reserved out of a [`Flash`] device.
///
/// All addresses accepted by [`Partition::read`]/[`Partition::write`]/
/// [`Partition::erase`] are relative to the start of the partition, not the
/// underlying device.
pub struct Partition<F> {
    flash: F,
    start_sector: u32,
    sector_count: u32,
    alignment: u32,
}

impl<F: Flash> Partition<F> {
    /// Carve a partition out of `flash` spanning `sector_count` sectors
    /// starting at `start_sector`.
    ///
    /// `alignment` must be a power of two no smaller than the device's own
    /// alignment; it becomes the alignment every write through this
    /// partition must satisfy.
    pub fn new(
        flash: F,
        start_sector: u32,
        sector_count: u32,
        alignment: u32,
    ) -> Result<Self, FlashError<F::Error>> {
        if !alignment.is_power_of_two() || alignment < flash.alignment() {
            return Err(FlashError::InvalidArgument);
        }
        if start_sector
            .checked_add(sector_count)
            .is_none_or(|end| end > flash.sector_count())
        {
            return Err(FlashError::InvalidArgument);
        }
        Ok(Self { flash, start_sector, sector_count, alignment })
    }

    /// Erase-unit size inherited from the underlying device.
    pub fn sector_size(&self) -> u32 {
        self.flash.sector_size()
    }

    /// Number of sectors reserved for this partition.
    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    /// Alignment every read/write through this partition must satisfy.
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Total size of the partition, in bytes.
    pub fn size(&self) -> u64 {
        u64::from(self.sector_count) * u64::from(self.sector_size())
    }

    fn device_address(&self, addr: u32) -> u32 {
        self.start_sector * self.sector_size() + addr
    }

    /// Read `buf.len()` bytes starting at partition-relative `addr`.
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError<F::Error>> {
        if u64::from(addr) + buf.len() as u64 > self.size() {
            return Err(FlashError::InvalidArgument);
        }
        let dev_addr = self.device_address(addr);
        self.flash.read(dev_addr, buf)
    }

    /// Write `data` starting at partition-relative `addr`. Both `addr` and
    /// `data.len()` must be multiples of [`Partition::alignment`].
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError<F::Error>> {
        if addr % self.alignment != 0 || data.len() as u64 % u64::from(self.alignment) != 0 {
            return Err(FlashError::InvalidArgument);
        }
        if u64::from(addr) + data.len() as u64 > self.size() {
            return Err(FlashError::InvalidArgument);
        }
        let dev_addr = self.device_address(addr);
        self.flash.write(dev_addr, data)
    }

    /// Erase `sectors` whole sectors starting at partition-relative `addr`.
    /// `addr` must be sector-aligned.
    pub fn erase(&mut self, addr: u32, sectors: u32) -> Result<(), FlashError<F::Error>> {
        let sector_size = self.sector_size();
        if addr % sector_size != 0 {
            return Err(FlashError::InvalidArgument);
        }
        let first_sector = addr / sector_size;
        if first_sector
            .checked_add(sectors)
            .is_none_or(|end| end > self.sector_count)
        {
            return Err(FlashError::InvalidArgument);
        }
        let dev_addr = self.device_address(addr);
        self.flash.erase(dev_addr, sectors)
    }

    /// Consume the partition, returning the underlying device.
    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Mutable access to the wrapped device, bypassing every invariant this
    /// partition otherwise enforces (alignment, erase-before-write, address
    /// bounds). Meant for test harnesses that need to poke the raw device
    /// backing an otherwise still-live partition, e.g. to simulate bit rot.
    pub fn device_mut(&mut self) -> &mut F {
        &mut self.flash
    }
}
