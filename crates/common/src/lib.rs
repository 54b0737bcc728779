//! Common types shared by the iFlow gateway crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
