//! # tessera-core
//!
//! Shared foundation types for the Tessera export engine:
//!
//! - **Strongly-typed identifiers**: `StepId` and `SpaceId` prevent mixing
//!   up different ID kinds at compile time
//! - **Core errors**: the error type shared by all Tessera crates
//!
//! This crate is intentionally small; everything domain-specific lives in
//! `tessera-engine`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;

pub use error::{Error, Result};
pub use id::{SpaceId, StepId};
