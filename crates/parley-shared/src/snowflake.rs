//! Snowflake-style message ids.
//!
//! A [`MessageId`] packs a millisecond timestamp, a producer id and a
//! per-millisecond sequence counter into 63 bits, giving globally unique,
//! roughly time-ordered ids without any coordination between producers.
//! Numeric order is the total order used to break `created_at` ties.

use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Custom epoch: 2024-01-01T00:00:00Z, so the timestamp fits 41 bits for
/// roughly 69 years.
const PARLEY_EPOCH_MS: u64 = 1_704_067_200_000;

const PRODUCER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const PRODUCER_MASK: u64 = (1 << PRODUCER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Globally unique, time-sortable message identifier.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Millisecond timestamp embedded in the id (since the Parley epoch).
    pub fn timestamp_ms(self) -> u64 {
        self.0 >> (PRODUCER_BITS + SEQUENCE_BITS)
    }

    pub fn producer(self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & PRODUCER_MASK) as u16
    }

    pub fn sequence(self) -> u16 {
        (self.0 & SEQUENCE_MASK) as u16
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(MessageId)
    }
}

/// Generator state: the last millisecond observed and the sequence counter
/// within it.
struct GeneratorState {
    last_ms: u64,
    sequence: u64,
}

/// Per-producer id generator.
///
/// Each producer (client process, server instance) owns one generator with
/// a distinct 10-bit producer id. Ids from a single generator are strictly
/// increasing; the clock never appears to move backwards because a stale
/// wall clock is clamped to the last observed millisecond.
pub struct MessageIdGenerator {
    producer: u64,
    state: Mutex<GeneratorState>,
}

impl MessageIdGenerator {
    pub fn new(producer: u16) -> Self {
        Self {
            producer: u64::from(producer) & PRODUCER_MASK,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// Generator with a random producer id, for processes without an
    /// assigned shard number.
    pub fn with_random_producer() -> Self {
        Self::new(rand::thread_rng().gen::<u16>() & PRODUCER_MASK as u16)
    }

    pub fn next_id(&self) -> MessageId {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let mut now = Self::now_ms().max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond; borrow from
                // the next one.
                now += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        MessageId(
            (now << (PRODUCER_BITS + SEQUENCE_BITS))
                | (self.producer << SEQUENCE_BITS)
                | state.sequence,
        )
    }

    fn now_ms() -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        now.saturating_sub(PARLEY_EPOCH_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let gen = MessageIdGenerator::new(7);
        let mut last = gen.next_id();
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > last, "{id} not greater than {last}");
            last = id;
        }
    }

    #[test]
    fn ids_embed_producer() {
        let gen = MessageIdGenerator::new(42);
        assert_eq!(gen.next_id().producer(), 42);
    }

    #[test]
    fn ids_are_unique_across_producers() {
        let a = MessageIdGenerator::new(1);
        let b = MessageIdGenerator::new(2);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1_000 {
            assert!(seen.insert(a.next_id()));
            assert!(seen.insert(b.next_id()));
        }
    }

    #[test]
    fn display_round_trip() {
        let id = MessageIdGenerator::new(3).next_id();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
