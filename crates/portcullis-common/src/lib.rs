//! # Portcullis Common
//!
//! Shared types, traits, and utilities used across Portcullis components.
//!
//! ## Modules
//! - `types` - Wire data structures (CodeDigest, TrustStatus, JoinRequest, etc.)
//! - `error` - External error taxonomy
//! - `constants` - Shared configuration constants

pub mod constants;
pub mod error;
pub mod types;

pub use error::PortcullisError;
pub use types::*;
