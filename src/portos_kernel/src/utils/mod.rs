//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless
//! specified otherwise. It's exposed only because it's needed by the port
//! crates.
mod init;
mod msb;
mod rawcell;

pub use self::{init::Init, msb::msb, rawcell::RawCell};
