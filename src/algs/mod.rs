//! Communication backends and the wire records they carry.

pub mod communicator;
pub mod wire;
