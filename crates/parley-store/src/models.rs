//! Domain model structs persisted in the relay log besides messages.
//!
//! Message and friendship shapes live in `parley-shared` because they
//! travel over the wire; these stay server-side.

use chrono::{DateTime, Utc};
use parley_shared::{GroupId, UserId};
use serde::{Deserialize, Serialize};

/// A registered user. The id is immutable; the display name is not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// A message group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
