//! LogKV core types
//!
//! This crate defines the pieces shared by every other LogKV crate:
//!
//! - [`Entry`], [`Value`] and [`TypeTag`] - the typed key/value record and
//!   its one-byte on-disk type discriminant
//! - the frame codec ([`Entry::encode`], [`Entry::decode`], [`read_value`])
//!   for the length-prefixed on-disk record format
//! - [`Error`] / [`Result`] - the unified error type for engine operations
//!
//! No I/O happens here; the codec works on in-memory byte slices so that
//! the storage crate can feed it from whatever read path it likes.

pub mod entry;
pub mod error;

pub use entry::{read_value, Entry, TypeTag, Value};
pub use error::{Error, Result};
