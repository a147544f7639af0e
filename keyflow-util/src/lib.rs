//! Small utilities shared by the keyflow crates.
#![deny(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod hash;

pub use hash::hash64;
