//! A crash-safe key-value store for raw NOR-style flash.
//!
//! Variable-length byte keys map to variable-length byte values. The
//! in-memory index (key hashes, and each key's current location on flash)
//! is reconstructed from flash contents at [`Kvs::mount`], so the only
//! state that must survive a reset is the flash itself. Every array is
//! statically sized by const generics chosen at the call site — there is
//! no dynamic allocation anywhere in this crate.
//!
//! ```
//! use flashkv::{checksum::Crc16, Kvs};
//! use flashkv_flash::Partition;
//! use flashkv_sim::MemoryFlash;
//!
//! let flash = MemoryFlash::new(4, 4096, 16);
//! let partition = Partition::new(flash, 0, 4, 16).unwrap();
//! let mut kvs = Kvs::<_, Crc16, 64, 4, 512, 4096, 0x4B56_5331>::format(partition).unwrap();
//!
//! kvs.put(b"a", b"1").unwrap();
//! let mut out = [0u8; 1];
//! let result = kvs.get(b"a", &mut out).unwrap();
//! assert_eq!(&out[..result.len], b"1");
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

pub mod checksum;
mod engine;
mod entry;
mod error;
mod index;
mod sector_table;

pub use engine::{GetResult, Iter, IterEntry, Kvs, MountOutcome};
pub use error::Error;
