//! Server test utilities and end-to-end scenarios.

pub mod utils;
