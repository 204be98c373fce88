//! Meterbill Shared Types
//!
//! This crate contains the identifier types shared across the meterbill crates.

pub mod types;

pub use types::*;
