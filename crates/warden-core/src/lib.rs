#![deny(missing_docs)]

//! # warden-core: Foundational Types for the Warden Policy Engine
//!
//! Types every other crate in the workspace depends on. No internal crate
//! dependencies: only `serde`, `serde_json`, `thiserror`, `chrono`, `uuid`,
//! and `sha2` from the external ecosystem.
//!
//! ## Design Principles
//!
//! 1. **Newtype wrappers for identifiers.** A [`PolicyId`] cannot be passed
//!    where a [`SubjectId`] is expected, and both validate their format at
//!    construction time.
//!
//! 2. **[`CanonicalBytes`] is the sole path to digest computation.** Audit
//!    entries are hash-chained; every digest flows through
//!    `CanonicalBytes::new()` so that two processes serializing the same entry
//!    always agree on its digest.
//!
//! 3. **[`WardenError`] hierarchy.** Structured errors with `thiserror`, no
//!    `Box<dyn Error>`, no `.unwrap()` outside tests.

pub mod canonical;
pub mod digest;
pub mod error;
pub mod identity;

// Re-export primary types at crate root for ergonomic imports.
pub use canonical::CanonicalBytes;
pub use digest::{sha256_digest, ContentDigest};
pub use error::{CanonicalizationError, ValidationError, WardenError};
pub use identity::{EventId, PolicyId, SubjectId};
