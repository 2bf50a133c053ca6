//! Pluggable entry checksum.
//!
//! The codec only requires something that can [`Checksum::update`] over a
//! byte stream and [`Checksum::finish`] into a digest of at most 16 bytes —
//! the same streaming-hasher shape the teacher's `transaction.rs` uses the
//! `crc` crate for (there: CRC-32 over a fixed transaction log entry; here:
//! a pluggable algorithm over a variable-length flash entry).

/// A streaming checksum algorithm, consumed once per entry encode/decode.
///
/// `SIZE` is the digest length in bytes and must not exceed 16 (the header's
/// checksum field budget). [`Checksum::finish`] always returns a 16-byte
/// buffer; only its first `SIZE` bytes are meaningful.
pub trait Checksum: Default {
    /// Digest length in bytes, `0..=16`.
    const SIZE: usize;

    /// Feed more bytes into the running checksum.
    fn update(&mut self, bytes: &[u8]);

    /// Consume the checksum, producing its digest left-aligned in a 16-byte
    /// buffer.
    fn finish(self) -> [u8; 16];
}

/// No integrity checking at all: `finish` always returns an empty digest, so
/// every entry whose magic and length fields are merely plausible is
/// accepted. Exists for tests and for deployments that accept the weaker
/// guarantee in exchange for not spending flash bytes on a checksum field.
#[derive(Default)]
pub struct NullChecksum;

impl Checksum for NullChecksum {
    const SIZE: usize = 0;
    fn update(&mut self, _bytes: &[u8]) {}
    fn finish(self) -> [u8; 16] {
        [0; 16]
    }
}

static CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// The default checksum: CRC-16/XMODEM over the whole entry (header with the
/// checksum field zeroed, key, value, and padding).
pub struct Crc16 {
    digest: crc::Digest<'static, u16>,
}

impl Default for Crc16 {
    fn default() -> Self {
        Self { digest: CRC16.digest() }
    }
}

impl Checksum for Crc16 {
    const SIZE: usize = 2;

    fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    fn finish(self) -> [u8; 16] {
        let value = self.digest.finalize();
        let mut out = [0u8; 16];
        out[..2].copy_from_slice(&value.to_le_bytes());
        out
    }
}
