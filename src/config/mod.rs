//! # HTOD Configuration Module
//!
//! Centralizes the configuration constants of the block store and the hash
//! table. Runtime settings (table size, load factor, auto-rehash) are chosen
//! per table through `HashtableBuilder`; the values here are the defaults and
//! the fixed layout parameters.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
