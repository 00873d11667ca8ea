//! Hash computation and object identity for the gitr git implementation.
//!
//! This crate provides the core `ObjectId` type, hash computation, hex
//! encoding/decoding, and specialized OID collections used throughout gitr.
//! The storage engine speaks SHA-1 only; there is no pluggable hash algorithm.

mod abbrev;
mod error;
pub mod hex;
mod oid;
pub mod hasher;
pub mod collections;
pub mod fanout;

pub use abbrev::{is_valid_abbrev, AbbreviatedObjectId, MINIMUM_ABBREV};
pub use error::HashError;
pub use oid::ObjectId;
