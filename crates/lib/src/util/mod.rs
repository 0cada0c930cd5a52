//! Shared utilities.
//!
//! Filesystem helpers used by the driver and test helpers.

pub mod fs;

#[cfg(test)]
pub mod testutil;
