//! Internal utilities.

pub mod arena;

pub use arena::{Arena, SlotKey};
