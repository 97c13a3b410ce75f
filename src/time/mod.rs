//! Time-based operations.

pub mod sleep;

pub use sleep::sleep;
