//! Test doubles for `flashkv`: an in-memory flash device and a power-loss
//! fault injector.
//!
//! Neither type has any business being linked into firmware; this crate
//! exists purely so `flashkv`'s test suite (and anyone else's) can exercise
//! the engine without real hardware, mirroring the role the teacher's
//! `fatrs-block-platform` plays for its own platform-specific
//! `BlockDevice` implementations, except here the one and only
//! "platform" is RAM.

use flashkv_flash::{Flash, FlashError};

/// An all-`0xFF`-backed fake flash device living entirely in RAM.
///
/// Enforces the same erase-before-write and alignment discipline a real
/// device would: [`Flash::write`] over bytes that aren't currently `0xFF`
/// fails with [`FlashError::Unknown`].
pub struct MemoryFlash {
    bytes: Vec<u8>,
    sector_size: u32,
    alignment: u32,
}

impl MemoryFlash {
    /// Create a fresh, fully-erased device with `sector_count` sectors of
    /// `sector_size` bytes each.
    pub fn new(sector_count: u32, sector_size: u32, alignment: u32) -> Self {
        Self {
            bytes: vec![0xFF; (sector_count * sector_size) as usize],
            sector_size,
            alignment,
        }
    }

    /// Rehydrate a device from its raw backing bytes, e.g. after simulating
    /// a crash via [`FaultInjectingFlash`] and wanting to mount a fresh
    /// instance over what actually made it to "flash".
    pub fn from_bytes(bytes: Vec<u8>, sector_size: u32, alignment: u32) -> Self {
        assert!(bytes.len() % sector_size as usize == 0);
        Self { bytes, sector_size, alignment }
    }

    /// Take the raw backing bytes, e.g. to hand to [`MemoryFlash::from_bytes`]
    /// for a simulated remount.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Borrow the raw backing bytes, for test assertions on physical layout.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Flash for MemoryFlash {
    type Error = ();

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.bytes.len() as u32 / self.sector_size
    }

    fn alignment(&self) -> u32 {
        self.alignment
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError<Self::Error>> {
        let start = address as usize;
        let end = start.checked_add(buf.len()).ok_or(FlashError::InvalidArgument)?;
        if end > self.bytes.len() {
            return Err(FlashError::InvalidArgument);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError<Self::Error>> {
        if address % self.alignment != 0 || data.len() as u32 % self.alignment != 0 {
            return Err(FlashError::InvalidArgument);
        }
        let start = address as usize;
        let end = start.checked_add(data.len()).ok_or(FlashError::InvalidArgument)?;
        if end > self.bytes.len() {
            return Err(FlashError::InvalidArgument);
        }
        // An erase-before-write violation is a driver-level integrity fault,
        // not a caller-argument mistake, so it is reported as `Unknown`
        // exactly like a real device would report a bus fault.
        if self.bytes[start..end].iter().any(|&b| b != 0xFF) {
            return Err(FlashError::Unknown(()));
        }
        self.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, address: u32, sector_count: u32) -> Result<(), FlashError<Self::Error>> {
        if address % self.sector_size != 0 {
            return Err(FlashError::InvalidArgument);
        }
        let start = address as usize;
        let len = (sector_count * self.sector_size) as usize;
        let end = start.checked_add(len).ok_or(FlashError::InvalidArgument)?;
        if end > self.bytes.len() {
            return Err(FlashError::InvalidArgument);
        }
        self.bytes[start..end].fill(0xFF);
        Ok(())
    }
}

/// Bypass-validation access to a fake flash's backing bytes, used only by
/// [`FaultInjectingFlash`] to model the partial, unvalidated effect a real
/// power failure has mid-write or mid-erase.
pub trait RawPoke {
    /// Overwrite `data.len()` bytes at `address` unconditionally, without
    /// the erase-before-write or alignment checks [`Flash::write`] enforces.
    fn force_write(&mut self, address: u32, data: &[u8]);
    /// Reset `len` bytes at `address` to `0xFF` unconditionally.
    fn force_erase(&mut self, address: u32, len: u32);
}

impl RawPoke for MemoryFlash {
    fn force_write(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        let end = start + data.len();
        self.bytes[start..end].copy_from_slice(data);
    }

    fn force_erase(&mut self, address: u32, len: u32) {
        let start = address as usize;
        let end = start + len as usize;
        self.bytes[start..end].fill(0xFF);
    }
}

/// Error type for [`FaultInjectingFlash`]: either the wrapped device's own
/// error, or a simulated power loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError<E> {
    /// The injected fault fired: the operation was truncated partway
    /// through, as if power had been cut mid-write or mid-erase.
    PowerLost,
    /// Passthrough of the wrapped device's own error.
    Inner(E),
}

/// Wraps a [`Flash`] device and can be armed to simulate power loss partway
/// through a future write or erase: the call applies only its first `n`
/// bytes worth of effect to the underlying device and reports
/// [`FaultError::PowerLost`], exactly the way a real power failure would
/// never return control to firmware at all. Tests that want to observe
/// "what actually made it to flash" pull the bytes back out via
/// [`FaultInjectingFlash::into_inner`] and mount a fresh engine over them.
pub struct FaultInjectingFlash<F> {
    inner: F,
    budget: Option<u32>,
}

impl<F> FaultInjectingFlash<F> {
    /// Wrap `inner` with no fault armed; behaves exactly like `inner` until
    /// [`FaultInjectingFlash::arm`] is called.
    pub fn new(inner: F) -> Self {
        Self { inner, budget: None }
    }

    /// Arm a fault to fire after `bytes_until_fault` more bytes have been
    /// written or erased (across calls).
    pub fn arm(&mut self, bytes_until_fault: u32) {
        self.budget = Some(bytes_until_fault);
    }

    /// Unwrap, recovering the underlying device (e.g. to inspect what
    /// actually landed on "flash" after a simulated crash).
    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: Flash + RawPoke> Flash for FaultInjectingFlash<F> {
    type Error = FaultError<F::Error>;

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }
    fn sector_count(&self) -> u32 {
        self.inner.sector_count()
    }
    fn alignment(&self) -> u32 {
        self.inner.alignment()
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError<Self::Error>> {
        self.inner.read(address, buf).map_err(|e| e.map_err(FaultError::Inner))
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError<Self::Error>> {
        if let Some(budget) = self.budget {
            if data.len() as u32 > budget {
                self.inner.force_write(address, &data[..budget as usize]);
                self.budget = Some(0);
                return Err(FlashError::Unknown(FaultError::PowerLost));
            }
            self.budget = Some(budget - data.len() as u32);
        }
        self.inner.write(address, data).map_err(|e| e.map_err(FaultError::Inner))
    }

    fn erase(&mut self, address: u32, sector_count: u32) -> Result<(), FlashError<Self::Error>> {
        let len = sector_count * self.inner.sector_size();
        if let Some(budget) = self.budget {
            if len > budget {
                self.inner.force_erase(address, budget);
                self.budget = Some(0);
                return Err(FlashError::Unknown(FaultError::PowerLost));
            }
            self.budget = Some(budget - len);
        }
        self.inner.erase(address, sector_count).map_err(|e| e.map_err(FaultError::Inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_is_all_ones() {
        let mut flash = MemoryFlash::new(4, 64, 16);
        let mut buf = [0u8; 16];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
    }

    #[test]
    fn write_over_dirty_bytes_fails() {
        let mut flash = MemoryFlash::new(4, 64, 16);
        flash.write(0, &[1; 16]).unwrap();
        assert_eq!(flash.write(0, &[2; 16]), Err(FlashError::Unknown(())));
    }

    #[test]
    fn erase_resets_to_all_ones() {
        let mut flash = MemoryFlash::new(4, 64, 16);
        flash.write(0, &[1; 16]).unwrap();
        flash.erase(0, 1).unwrap();
        let mut buf = [0u8; 16];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
    }

    #[test]
    fn fault_truncates_write_and_reports_power_lost() {
        let mut flash = FaultInjectingFlash::new(MemoryFlash::new(4, 64, 16));
        flash.arm(8);
        let err = flash.write(0, &[0xAB; 16]).unwrap_err();
        assert_eq!(err, FlashError::Unknown(FaultError::PowerLost));

        let inner = flash.into_inner();
        assert_eq!(&inner.as_bytes()[0..8], &[0xAB; 8]);
        assert_eq!(&inner.as_bytes()[8..16], &[0xFF; 8]);
    }

    #[test]
    fn fault_truncates_erase() {
        let mut flash = MemoryFlash::new(4, 64, 16);
        flash.write(0, &[1; 64]).unwrap();
        let mut flash = FaultInjectingFlash::new(flash);
        flash.arm(32);
        assert!(flash.erase(0, 1).is_err());
        let inner = flash.into_inner();
        assert_eq!(&inner.as_bytes()[0..32], &[0xFF; 32]);
        assert_eq!(&inner.as_bytes()[32..64], &[1; 32]);
    }
}
