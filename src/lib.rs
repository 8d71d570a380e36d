//! Deferral: thread-safe deferred results with dynamic callback chains.
//!
//! # Overview
//!
//! A [`Deferred`] is a future result with a processing pipeline attached.
//! Where a plain future hands you the value once, a deferred carries an
//! ordered chain of transformations that can keep growing — even after the
//! result arrived — and every link's output feeds the next link. A link
//! that returns another deferred transparently parks the chain until that
//! inner result is ready, and a parallel error path makes failure handling
//! part of the same pipeline instead of an afterthought.
//!
//! # Core guarantees
//!
//! - **One result**: a deferred is completed exactly once; completing it
//!   again is a contract violation and panics.
//! - **One drain at a time**: only one thread executes a chain, and each
//!   link's effects happen-before the next link runs.
//! - **No threads of its own**: links run on whichever thread delivers the
//!   result; the crate never spawns or schedules anything.
//! - **Prompt release**: a link is dropped as soon as it has executed, so
//!   captured resources are released without waiting for the deferred to
//!   be dropped.
//! - **Bounded chains**: runaway cycles of mutually dependent deferreds
//!   fail fast against the chain-length bound instead of recursing
//!   forever.
//!
//! # Module structure
//!
//! - [`deferred`]: the deferred itself — state machine, callback
//!   registration, continuations, joining
//! - [`error`]: carried-error taxonomy
//! - [`group`]: N-to-1 aggregation of deferreds
//!
//! # Example
//!
//! ```
//! use deferral::{Deferred, Error};
//!
//! let lookup: Deferred<String> = Deferred::new();
//! let shouted = lookup
//!     .on_success(|name: String| name.to_uppercase())
//!     .on_error(|e: Error| format!("<unknown: {}>", e.message()));
//!
//! // ... some producer eventually posts the result:
//! lookup.complete("ada".to_owned());
//! assert_eq!(shouted.join().unwrap(), "ADA");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

mod chain;
mod payload;

pub mod deferred;
pub mod error;
pub mod group;

#[cfg(test)]
pub(crate) mod test_utils;

pub use deferred::{Deferred, IntoStep, Step};
pub use error::{Error, ErrorKind, Result};
pub use group::{group, group_in_order, GroupError};
pub use payload::Carry;
