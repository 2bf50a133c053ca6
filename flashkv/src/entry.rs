//! On-flash entry format: header layout, encode, decode.
//!
//! Layout (all integers little-endian), header followed by raw key bytes,
//! raw value bytes, and trailing `0x00` padding out to the entry's
//! alignment:
//!
//! | field | width | semantics |
//! |---|---|---|
//! | magic | 4 B | deployment constant identifying the format dialect |
//! | checksum | `C::SIZE` B (≤16) | over the rest of the entry, checksum bytes zeroed |
//! | flags_and_units | 1 B | high nibble: [`EntryFlags`]; low nibble: alignment unit count |
//! | key_length | 1 B | `1..=64` |
//! | value_length | 2 B | `0..=max_value_len` |
//! | transaction_id | 4 B | monotonically increasing per successful write |
//!
//! The delete marker rides in the high nibble of the byte spec.md calls
//! `alignment_units` rather than adding a field the header table doesn't
//! list — one of the two encodings spec.md's design notes explicitly
//! sanction ("implementations may dedicate a bit in `alignment_units`' high
//! nibble ... chosen once and fixed").

use bitflags::bitflags;

use crate::checksum::Checksum;

bitflags! {
    /// Flags packed into the high nibble of the entry's `flags_and_units`
    /// header byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        /// This entry is a tombstone: `value_length` is always `0` when
        /// this bit is set.
        const DELETED = 0b0001_0000;
    }
}

const ALIGNMENT_UNITS_MASK: u8 = 0b0000_1111;

/// Minimum key length, inclusive.
pub const KEY_LEN_MIN: usize = 1;
/// Maximum key length, inclusive.
pub const KEY_LEN_MAX: usize = 64;

/// Fixed-width portion of the header, excluding the checksum field whose
/// width depends on `C`.
const HEADER_FIXED_LEN: usize = 4 /* magic */ + 1 /* flags_and_units */ + 1 /* key_length */
    + 2 /* value_length */ + 4 /* transaction_id */;

/// Total header length for checksum algorithm `C`.
pub const fn header_len<C: Checksum>() -> usize {
    HEADER_FIXED_LEN + C::SIZE
}

/// Fields decoded from a valid, checksum-verified entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedHeader {
    pub key_length: u8,
    pub value_length: u16,
    pub transaction_id: u32,
    pub deleted: bool,
    alignment_units: u8,
}

/// Errors specific to header/entry parsing. Always mapped to
/// [`crate::Error::DataLoss`] or [`crate::Error::InvalidArgument`] by
/// callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// `buf` was shorter than the header, or shorter than the entry the
    /// header claims.
    Truncated,
    /// Magic did not match; `buf` does not look like an entry at all.
    BadMagic,
    /// Magic matched but a length field was out of range, or the computed
    /// entry length overran the sector. Distinct from a checksum mismatch
    /// because it is detected before the checksum is even computed.
    Malformed,
    /// Checksum did not match.
    ChecksumMismatch,
    /// `key`/`value` lengths, or the resulting encoded length, violate a
    /// documented precondition.
    InvalidArgument,
}

/// The alignment actually used by an entry encoded with `alignment_units`,
/// given the partition's own minimum alignment.
///
/// Per spec.md §3: "actual alignment = (units+1)·16 bytes, clamped to ≥
/// partition alignment".
pub fn effective_alignment(alignment_units: u8, partition_alignment: u32) -> u32 {
    let nominal = (u32::from(alignment_units & ALIGNMENT_UNITS_MASK) + 1) * 16;
    nominal.max(partition_alignment)
}

/// The smallest `alignment_units` value whose resulting alignment is at
/// least `partition_alignment`. flashkv always encodes with this value, so
/// every entry's on-flash alignment equals its partition's alignment
/// (rounded up to the nearest 16-byte unit boundary).
fn units_for(partition_alignment: u32) -> u8 {
    let mut units: u32 = 0;
    while (units + 1) * 16 < partition_alignment && units < 15 {
        units += 1;
    }
    units as u8
}

/// Round `value` up to the next multiple of `align`.
pub fn round_up(value: usize, align: u32) -> usize {
    let align = align as usize;
    value.div_ceil(align) * align
}

/// The total on-flash length of an entry with the given key/value lengths,
/// once alignment padding is applied.
pub fn encoded_len<C: Checksum>(key_len: usize, value_len: usize, partition_alignment: u32) -> usize {
    let align = effective_alignment(units_for(partition_alignment), partition_alignment);
    round_up(header_len::<C>() + key_len + value_len, align)
}

/// Encode `key`/`value` into `out`, returning the number of bytes written
/// (which may be less than `out.len()`).
///
/// `out` must be at least [`encoded_len`] bytes; the checksum is computed
/// last, over the whole entry with the checksum field zeroed, matching
/// spec.md §4.2.
pub fn encode<C: Checksum>(
    magic: u32,
    key: &[u8],
    value: &[u8],
    transaction_id: u32,
    deleted: bool,
    partition_alignment: u32,
    out: &mut [u8],
) -> Result<usize, CodecError> {
    if !(KEY_LEN_MIN..=KEY_LEN_MAX).contains(&key.len()) {
        return Err(CodecError::InvalidArgument);
    }
    if value.len() > u16::MAX as usize {
        return Err(CodecError::InvalidArgument);
    }
    if deleted && !value.is_empty() {
        return Err(CodecError::InvalidArgument);
    }

    let hl = header_len::<C>();
    let units = units_for(partition_alignment);
    let align = effective_alignment(units, partition_alignment);
    let total = round_up(hl + key.len() + value.len(), align);
    if out.len() < total {
        return Err(CodecError::InvalidArgument);
    }

    let buf = &mut out[..total];
    buf.fill(0);
    buf[0..4].copy_from_slice(&magic.to_le_bytes());

    let mut off = 4 + C::SIZE;
    let mut flags_and_units = units;
    if deleted {
        flags_and_units |= EntryFlags::DELETED.bits();
    }
    buf[off] = flags_and_units;
    off += 1;
    buf[off] = key.len() as u8;
    off += 1;
    buf[off..off + 2].copy_from_slice(&(value.len() as u16).to_le_bytes());
    off += 2;
    buf[off..off + 4].copy_from_slice(&transaction_id.to_le_bytes());
    off += 4;
    debug_assert_eq!(off, hl);

    buf[hl..hl + key.len()].copy_from_slice(key);
    buf[hl + key.len()..hl + key.len() + value.len()].copy_from_slice(value);
    // trailing padding bytes are already zero from `buf.fill(0)` above.

    let mut checksum = C::default();
    checksum.update(buf); // checksum field within `buf` is still zero here
    let digest = checksum.finish();
    buf[4..4 + C::SIZE].copy_from_slice(&digest[..C::SIZE]);

    Ok(total)
}

/// Decode and checksum-verify an entry from `buf`.
///
/// `buf` must contain at least the header; if the header's length fields
/// claim an entry longer than `buf`, [`CodecError::Truncated`] is returned
/// so the caller can read more and retry (used during sector scan, where
/// the header is read before the full entry length is known).
pub fn decode<C: Checksum>(
    magic: u32,
    buf: &[u8],
    partition_alignment: u32,
    max_value_len: usize,
) -> Result<(DecodedHeader, usize), CodecError> {
    let hl = header_len::<C>();
    if buf.len() < hl {
        return Err(CodecError::Truncated);
    }
    let got_magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if got_magic != magic {
        return Err(CodecError::BadMagic);
    }

    let mut off = 4 + C::SIZE;
    let flags_and_units = buf[off];
    off += 1;
    let key_length = buf[off];
    off += 1;
    let value_length = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap());
    off += 2;
    let transaction_id = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    debug_assert_eq!(off, hl);

    if !(KEY_LEN_MIN..=KEY_LEN_MAX).contains(&(key_length as usize)) {
        return Err(CodecError::Malformed);
    }
    if value_length as usize > max_value_len {
        return Err(CodecError::Malformed);
    }

    let align = effective_alignment(flags_and_units, partition_alignment);
    let total = round_up(hl + key_length as usize + value_length as usize, align);
    if buf.len() < total {
        return Err(CodecError::Truncated);
    }

    let mut checksum = C::default();
    checksum.update(&buf[0..4]);
    let zeros = [0u8; 16];
    checksum.update(&zeros[..C::SIZE]);
    checksum.update(&buf[4 + C::SIZE..total]);
    let digest = checksum.finish();
    if digest[..C::SIZE] != buf[4..4 + C::SIZE] {
        return Err(CodecError::ChecksumMismatch);
    }

    let deleted = flags_and_units & EntryFlags::DELETED.bits() != 0;
    if deleted && value_length != 0 {
        return Err(CodecError::Malformed);
    }

    Ok((
        DecodedHeader {
            key_length,
            value_length,
            transaction_id,
            deleted,
            alignment_units: flags_and_units,
        },
        total,
    ))
}

/// Offset of the key bytes within a decoded entry buffer.
pub fn key_offset<C: Checksum>() -> usize {
    header_len::<C>()
}

/// Offset of the value bytes within a decoded entry buffer.
pub fn value_offset<C: Checksum>(header: &DecodedHeader) -> usize {
    header_len::<C>() + header.key_length as usize
}

/// Total on-flash length (header + key + value + padding) of a decoded
/// entry, given the partition alignment it was decoded with.
pub fn total_len(header: &DecodedHeader, header_len: usize, partition_alignment: u32) -> usize {
    let align = effective_alignment(header.alignment_units, partition_alignment);
    round_up(header_len + header.key_length as usize + header.value_length as usize, align)
}

/// Returns `true` if every byte in `buf` is `0xFF` (erased / free space).
pub fn is_all_erased(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0xFF)
}
