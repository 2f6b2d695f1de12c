//! # parley-shared
//!
//! Types shared between the Parley relay server and the desktop client:
//! identities, conversation keys, the message model, snowflake message ids,
//! and the bincode-framed wire protocol.

pub mod protocol;
pub mod snowflake;
pub mod types;

pub use snowflake::{MessageId, MessageIdGenerator};
pub use types::*;
