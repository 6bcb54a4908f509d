//! Snowflake-style unique ID generation.
//!
//! Layout of a generated i64: 41 bits of milliseconds since a fixed epoch,
//! 10 bits of node number, 12 bits of per-millisecond sequence. Generators
//! are constructed explicitly and passed to whoever needs IDs — there is
//! deliberately no process-wide default instance.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::ensure;

const SEQUENCE_BITS: u32 = 12;
const NODE_ID_BITS: u32 = 10;

const NODE_ID_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + NODE_ID_BITS;

const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;
/// Highest node number the layout can carry.
pub const MAX_NODE_ID: i64 = (1 << NODE_ID_BITS) - 1;

/// Milliseconds for 2020-01-01 00:00:00 UTC; keeps 41 timestamp bits good
/// for roughly 69 years of IDs.
const CUSTOM_EPOCH_MS: i64 = 1_577_836_800_000;

struct GeneratorState {
    last_ms: i64,
    sequence: i64,
}

/// A thread-safe source of unique, roughly time-ordered 64-bit IDs.
pub struct IdGenerator {
    node_id: i64,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// Creates a generator for the given node number (0..=[`MAX_NODE_ID`]).
    pub fn new(node_id: i64) -> anyhow::Result<Self> {
        ensure!(
            (0..=MAX_NODE_ID).contains(&node_id),
            "node id must be between 0 and {MAX_NODE_ID}, got {node_id}"
        );
        Ok(Self {
            node_id,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    /// Produces the next unique ID.
    pub fn next(&self) -> i64 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut now = now_millis();
        // A clock that stepped backwards reuses the last timestamp rather
        // than risking duplicate IDs.
        if now < state.last_ms {
            now = state.last_ms;
        }
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond; borrow the
                // next one instead of spinning.
                now = state.last_ms + 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        ((now - CUSTOM_EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.node_id << NODE_ID_SHIFT)
            | state.sequence
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn node_id_range_is_enforced() {
        assert!(IdGenerator::new(0).is_ok());
        assert!(IdGenerator::new(MAX_NODE_ID).is_ok());
        assert!(IdGenerator::new(-1).is_err());
        assert!(IdGenerator::new(MAX_NODE_ID + 1).is_err());
    }

    #[test]
    fn ids_are_unique_under_contention() {
        let generator = Arc::new(IdGenerator::new(3).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = generator.clone();
            handles.push(std::thread::spawn(move || {
                (0..1_000).map(|_| generator.next()).collect::<Vec<_>>()
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate id generated");
            }
        }
        assert_eq!(all.len(), 8_000);
    }

    #[test]
    fn ids_embed_the_node_number() {
        let generator = IdGenerator::new(42).unwrap();
        let id = generator.next();
        assert_eq!((id >> NODE_ID_SHIFT) & MAX_NODE_ID, 42);
    }
}
