//! # Configuration Module
//!
//! Centralizes the on-disk geometry constants for burrowdb. All sizes are
//! compile-time constants with assertions that enforce their derivations;
//! see [`constants`] for the dependency graph.

mod constants;

pub use constants::*;
