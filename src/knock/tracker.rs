//! Per-source sequence state machine.
//!
//! The [`StateTracker`] exclusively owns every in-progress [`SequenceState`].
//! States live in a sharded [`DashMap`]; each transition runs while holding
//! the write lock of the shard that owns the source address, so transitions
//! for one address are serialized while unrelated addresses (on other
//! shards) proceed in parallel. The lock is never held across an `.await`.
//!
//! Expiry is lazy: a state older than the window is discarded when the next
//! knock from that source arrives. [`StateTracker::purge_expired`] bounds
//! memory for sources that start a sequence and never come back.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{KnockEvent, SequenceConfig};

/// Progress of one source through the knock sequence.
///
/// `next_index` is always in `1..sequence.len()`: a state is only created
/// after a correct first knock and is removed the moment it would reach
/// the end of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceState {
    /// Address this state belongs to
    pub source: IpAddr,
    /// Index into the sequence of the port expected next
    pub next_index: usize,
    /// Timestamp of the first knock of this attempt
    pub first_seen_at: Instant,
    /// Timestamp of the most recent matching knock
    pub last_seen_at: Instant,
}

impl SequenceState {
    fn start(event: &KnockEvent) -> Self {
        Self {
            source: event.source,
            next_index: 1,
            first_seen_at: event.at,
            last_seen_at: event.at,
        }
    }

    /// Time elapsed since the first knock, as seen at `now`.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_seen_at)
    }
}

/// What a single knock did to its source's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No live state and the port is not the first of the sequence.
    Unmatched,
    /// First port knocked; a new attempt is in progress.
    Started,
    /// Correct port; the attempt moved forward.
    Advanced {
        /// Index of the port now expected
        next_index: usize,
    },
    /// Final port knocked in order within the window. The state is gone.
    Completed {
        /// Time from the first to the final knock
        elapsed: Duration,
    },
    /// Wrong port for the current position. The attempt was discarded.
    OutOfOrder {
        /// Port that was expected
        expected: u16,
        /// Number of correct knocks that were thrown away
        progress: usize,
    },
}

/// Result of applying one knock to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnockOutcome {
    /// Transition taken for this knock
    pub step: Step,
    /// Age of a stale attempt that was discarded before evaluating this
    /// knock, if any
    pub expired: Option<Duration>,
}

impl KnockOutcome {
    /// Whether this knock completed a sequence.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.step, Step::Completed { .. })
    }
}

/// Owner of all in-progress sequence states.
#[derive(Debug)]
pub struct StateTracker {
    config: Arc<SequenceConfig>,
    states: DashMap<IpAddr, SequenceState>,
}

impl StateTracker {
    /// Creates an empty tracker for the given sequence.
    #[must_use]
    pub fn new(config: Arc<SequenceConfig>) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    /// The sequence this tracker enforces.
    #[must_use]
    pub fn config(&self) -> &SequenceConfig {
        &self.config
    }

    /// Applies one knock and returns the transition taken.
    ///
    /// Holds the shard lock for `event.source` for the duration of the
    /// transition only.
    pub fn apply(&self, event: &KnockEvent) -> KnockOutcome {
        match self.states.entry(event.source) {
            Entry::Occupied(mut slot) => {
                let (next, outcome) = transition(&self.config, Some(slot.get()), event);
                match next {
                    Some(state) => *slot.get_mut() = state,
                    None => {
                        slot.remove();
                    }
                }
                outcome
            }
            Entry::Vacant(slot) => {
                let (next, outcome) = transition(&self.config, None, event);
                if let Some(state) = next {
                    slot.insert(state);
                }
                outcome
            }
        }
    }

    /// Removes every state whose attempt started more than one window ago.
    ///
    /// Returns the number of states removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let window = self.config.window();
        let mut removed = 0;
        self.states.retain(|_, state| {
            let keep = state.age(now) <= window;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Snapshot of the state for `source`, if an attempt is in progress.
    #[must_use]
    pub fn get(&self, source: &IpAddr) -> Option<SequenceState> {
        self.states.get(source).map(|entry| *entry.value())
    }

    /// Number of sources with an attempt in progress.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no attempt is in progress.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Discards every in-progress attempt.
    pub fn clear(&self) {
        self.states.clear();
    }
}

/// The transition function.
///
/// Returns the state to store for the source (`None` removes it) together
/// with the outcome.
fn transition(
    config: &SequenceConfig,
    current: Option<&SequenceState>,
    event: &KnockEvent,
) -> (Option<SequenceState>, KnockOutcome) {
    let mut expired = None;
    let live = match current {
        Some(state) if state.age(event.at) > config.window() => {
            expired = Some(state.age(event.at));
            None
        }
        other => other,
    };

    let (next, step) = match live {
        None if config.port_at(0) == Some(event.port) => {
            (Some(SequenceState::start(event)), Step::Started)
        }
        None => (None, Step::Unmatched),
        Some(state) => {
            let expected = config.sequence()[state.next_index];
            if event.port != expected {
                (
                    None,
                    Step::OutOfOrder {
                        expected,
                        progress: state.next_index,
                    },
                )
            } else if state.next_index + 1 == config.len() {
                (
                    None,
                    Step::Completed {
                        elapsed: state.age(event.at),
                    },
                )
            } else {
                let next_index = state.next_index + 1;
                (
                    Some(SequenceState {
                        next_index,
                        last_seen_at: event.at,
                        ..*state
                    }),
                    Step::Advanced { next_index },
                )
            }
        }
    };

    (next, KnockOutcome { step, expired })
}
