//! Common types for the Gemini key-pool proxy

mod error;
mod keys;
mod secret;

pub use error::{Error, Result};
pub use keys::split_key_list;
pub use secret::Secret;
