//! # parley-store
//!
//! Durable SQLite storage for Parley, used on both sides of the wire:
//!
//! - the **relay log**: the server's append-only message table with
//!   per-recipient delivery status, friendships and group membership;
//! - the **local cache**: the client's per-user message history with its
//!   own send-state column and tombstones for abandoned send attempts.
//!
//! Both schemas evolve through versioned migrations guarded by
//! `PRAGMA user_version`; the prior database file is backed up before any
//! pending migration runs, keeping a bounded number of backups.

pub mod backup;
pub mod cache;
pub mod contacts;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
