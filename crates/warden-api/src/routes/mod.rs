//! # Route Modules
//!
//! Each module defines an Axum Router for one API surface area.
//! Routers are assembled in `lib.rs` into the application.

pub mod audit;
pub mod events;
pub mod policies;
