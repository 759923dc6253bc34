//! Birth-death-migration math utilities.

pub mod scaled;

pub use scaled::*;
