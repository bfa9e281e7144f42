//! Snowflake-style distributed ID generation.
//!
//! An ID is a positive 64-bit integer laid out as
//!
//! ```text
//! | 1 bit unused | 41 bits millis since epoch | 10 bits node | 12 bits sequence |
//! ```
//!
//! IDs from one [`IdGenerator`] are strictly increasing while the wall clock
//! does not move backwards. Different processes stay disjoint through the node
//! bits, so no coordination is needed. Construct one generator at startup and
//! share it by `Arc`.

use crate::hash::stable_hash;
use std::fmt;
use std::fs;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Custom epoch, 2015-01-01T00:00:00Z in Unix milliseconds.
pub const DEFAULT_EPOCH_MS: u64 = 1_420_070_400_000;

const NODE_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
const NET_CLASS_DIR: &str = "/sys/class/net";

/// Errors from ID generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The wall clock reads earlier than the last issued timestamp.
    ClockMovedBackwards {
        /// Last issued timestamp, millis since the custom epoch.
        last_ms: u64,
        /// Current reading, millis since the custom epoch.
        now_ms: u64,
    },
    /// An explicitly supplied node id does not fit in 10 bits.
    InvalidNodeId {
        /// The rejected node id.
        node_id: u16,
    },
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClockMovedBackwards { last_ms, now_ms } => write!(
                f,
                "clock moved backwards: refusing to generate ids for {} ms",
                last_ms - now_ms
            ),
            Self::InvalidNodeId { node_id } => {
                write!(f, "node id {node_id} exceeds maximum {MAX_NODE_ID}")
            }
        }
    }
}

impl std::error::Error for IdError {}

/// The components of a generated ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedId {
    /// Unix timestamp in milliseconds (custom epoch already added back).
    pub timestamp_ms: u64,
    /// Node that generated the ID.
    pub node_id: u16,
    /// Per-millisecond sequence number.
    pub sequence: u16,
}

#[derive(Debug, Default)]
struct State {
    last_timestamp: u64,
    sequence: u16,
}

/// Thread-safe Snowflake ID generator.
#[derive(Debug)]
pub struct IdGenerator {
    node_id: u16,
    epoch_ms: u64,
    state: Mutex<State>,
}

impl IdGenerator {
    /// Creates a generator whose node id is derived from this host.
    #[must_use]
    pub fn new() -> Self {
        let node_id = node_id_from_host();
        debug!(node_id, "derived snowflake node id");
        Self::build(node_id)
    }

    /// Creates a generator with an explicit node id.
    ///
    /// # Errors
    ///
    /// Returns an error if `node_id` does not fit in 10 bits.
    pub fn with_node_id(node_id: u16) -> crate::Result<Self, IdError> {
        if node_id > MAX_NODE_ID {
            return Err(IdError::InvalidNodeId { node_id }.into());
        }
        Ok(Self::build(node_id))
    }

    /// Replaces the custom epoch.
    #[must_use]
    pub fn with_epoch(mut self, epoch_ms: u64) -> Self {
        self.epoch_ms = epoch_ms;
        self
    }

    fn build(node_id: u16) -> Self {
        Self {
            node_id,
            epoch_ms: DEFAULT_EPOCH_MS,
            state: Mutex::new(State::default()),
        }
    }

    /// Returns the node id embedded in every generated ID.
    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Generates the next ID.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::ClockMovedBackwards`] if the system clock reads
    /// earlier than the previous call. This is not retryable.
    pub fn next_id(&self) -> crate::Result<u64, IdError> {
        self.generate(unix_millis)
    }

    /// Generates the next ID as a typed identifier.
    ///
    /// # Errors
    ///
    /// See [`IdGenerator::next_id`].
    pub fn next<I: From<u64>>(&self) -> crate::Result<I, IdError> {
        self.next_id().map(I::from)
    }

    /// Splits an ID into its timestamp, node and sequence.
    #[must_use]
    pub fn parse(&self, id: u64) -> ParsedId {
        ParsedId {
            timestamp_ms: (id >> (NODE_ID_BITS + SEQUENCE_BITS)) + self.epoch_ms,
            node_id: ((id >> SEQUENCE_BITS) & u64::from(MAX_NODE_ID)) as u16,
            sequence: (id & u64::from(MAX_SEQUENCE)) as u16,
        }
    }

    fn generate(&self, mut clock: impl FnMut() -> u64) -> crate::Result<u64, IdError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut now = clock().saturating_sub(self.epoch_ms);

        if now < state.last_timestamp {
            warn!(
                last_ms = state.last_timestamp,
                now_ms = now,
                "clock moved backwards"
            );
            return Err(IdError::ClockMovedBackwards {
                last_ms: state.last_timestamp,
                now_ms: now,
            }
            .into());
        }

        if now == state.last_timestamp {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond.
                while now <= state.last_timestamp {
                    std::hint::spin_loop();
                    now = clock().saturating_sub(self.epoch_ms);
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = now;
        Ok((now << (NODE_ID_BITS + SEQUENCE_BITS))
            | (u64::from(self.node_id) << SEQUENCE_BITS)
            | u64::from(state.sequence))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Derives a 10-bit node id from the host's hardware addresses, falling back
/// to a random value when none are readable.
fn node_id_from_host() -> u16 {
    let addresses = hardware_addresses();
    let raw = if addresses.is_empty() {
        random_u32()
    } else {
        stable_hash(addresses.as_bytes()) as u32
    };
    (raw as u16) & MAX_NODE_ID
}

fn hardware_addresses() -> String {
    let Ok(entries) = fs::read_dir(NET_CLASS_DIR) else {
        return String::new();
    };
    let mut interfaces: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    interfaces.sort();

    interfaces
        .iter()
        .filter_map(|path| fs::read_to_string(path.join("address")).ok())
        .map(|mac| mac.trim().replace(':', "").to_uppercase())
        .filter(|hex| !hex.is_empty() && hex.chars().any(|c| c != '0'))
        .collect()
}

fn random_u32() -> u32 {
    getrandom::u32().unwrap_or_else(|e| {
        warn!(error = %e, "secure random unavailable, using process id for node id");
        std::process::id()
    })
}
