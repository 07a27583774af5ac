pub mod config;
pub mod error;
pub mod keys;
pub mod types;

pub use error::{ApiErrorKind, CryptoError, NimbusError, NimbusResult};
