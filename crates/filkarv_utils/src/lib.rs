//! Internal helper crate for filkarv.
//!
//! Not for external usage. No stability guarantees whatsoever.

pub mod digest;
