//! Common types and helpers

pub mod error;
pub mod net;

pub use error::{Error, Result};
