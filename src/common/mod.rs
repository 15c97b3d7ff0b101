//! Common utilities and types

pub mod error;
pub mod net;
pub mod random;

pub use error::{Error, Result};
pub use random::PaddingToken;
