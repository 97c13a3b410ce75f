//! Internal records for frames and scopes.

pub mod frame;
pub mod scope;
