//! # parley-client
//!
//! Client-side reconciliation layer for the Parley messenger.
//!
//! The [`Reconciler`] sits between a UI and the relay connection. It keeps
//! the local cache as the single source of truth for what the UI renders:
//! sends are inserted optimistically as `sending`, resolved to `sent` by
//! server acknowledgments or to `fail` by a bounded timer, and incoming
//! messages are deduplicated by id before the UI ever sees them.

pub mod error;
pub mod events;
pub mod reconciler;

pub use error::ClientError;
pub use events::ClientEvent;
pub use reconciler::{Reconciler, ReconcilerConfig};
