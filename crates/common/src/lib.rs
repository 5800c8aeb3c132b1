//! Common types shared by the image generation gateway crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
