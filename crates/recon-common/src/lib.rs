//! Recon Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the reconciliation workspace.
//!
//! # Overview
//!
//! This crate provides functionality used by every workspace member:
//!
//! - **Error Handling**: the shared `ReconError` for enum parsing
//! - **Hashing**: digest helpers used for canonical record hashes
//! - **Logging**: tracing subscriber setup shared by all binaries
//! - **Types**: entity types, check types, severities and run modes
//!
//! # Example
//!
//! ```no_run
//! use recon_common::hashing::{digest_hex, HashAlgorithm};
//! use recon_common::types::EntityType;
//!
//! let entity: EntityType = "volunteer".parse().unwrap();
//! let hash = digest_hex(HashAlgorithm::Sha256, b"id=0031\x1fname=Ada");
//! println!("{entity}: {hash}");
//! ```

pub mod error;
pub mod hashing;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::ReconError;
pub use types::{CheckType, EntityType, Severity, ValidationMode};
