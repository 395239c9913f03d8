//! Key/value store backend implementations

pub mod file;
pub mod mem;
