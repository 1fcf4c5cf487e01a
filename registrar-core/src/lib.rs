//! Core types and ports for the registrar event-sourced student records.
//!
//! - [`domain`] - Student payloads, state and their pure `Apply` handlers
//! - [`event`] - Identifiers, event kinds and the persisted [`Envelope`](event::Envelope)
//! - [`registry`] - Tag-to-decoder mapping used during replay
//! - [`student`] - The aggregate: replay, issuing events, lifecycle
//! - [`concurrency`] - Optimistic concurrency conflicts
//! - [`store`] - Event persistence abstraction (`EventStore`)
//! - [`snapshot`] - Snapshot storage abstraction (`SnapshotStore`)
//! - [`repository`] - Load, commit and retry (`Repository`)
//! - [`projection`] - Read rows and the notification router
//! - [`subscription`] - Push-based projection worker
//!
//! # Example
//!
//! ```
//! use registrar_core::{repository::Repository, store::inmemory};
//!
//! let repo = Repository::new(inmemory::Store::new());
//! ```
//!
//! Most users should depend on the [`registrar`](https://docs.rs/registrar)
//! crate, which re-exports these types.

pub mod concurrency;
pub mod domain;
pub mod event;
pub mod projection;
pub mod registry;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod student;
pub mod subscription;

// Test utilities module: public when feature enabled, internal for crate tests
#[cfg(feature = "test-util")]
pub mod test;

#[cfg(all(test, not(feature = "test-util")))]
pub(crate) mod test;
