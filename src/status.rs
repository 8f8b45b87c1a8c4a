//! Status board: live per-source state for the terminal view.
//!
//! The set of rows is fixed at construction, in display order
//! (stateful sources first, then stateless, each in configured order).
//! Each row has its own lock, so concurrent stateless workers only
//! contend when they touch the same source.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::warn;
use rust_decimal::Decimal;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl CollectorStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Transitions are monotonic within a run: nothing leaves a
    /// terminal state and nothing goes back to `Pending`.
    pub fn can_become(self, next: CollectorStatus) -> bool {
        match (self, next) {
            (a, b) if a.is_terminal() => a == b,
            (_, Self::Pending) => self == Self::Pending,
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for CollectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `StatusBoard::snapshot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardRow {
    pub source: String,
    pub status: CollectorStatus,
    pub last_value: Option<Decimal>,
}

#[derive(Debug)]
struct Slot {
    source: String,
    state: Mutex<SlotState>,
}

#[derive(Debug, Clone, Copy)]
struct SlotState {
    status: CollectorStatus,
    last_value: Option<Decimal>,
}

#[derive(Debug)]
pub struct StatusBoard {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    version: watch::Sender<u64>,
}

impl StatusBoard {
    /// Builds a board with every source `Pending`, in the given order.
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots: Vec<Slot> = sources
            .into_iter()
            .map(|s| Slot {
                source: s.into(),
                state: Mutex::new(SlotState {
                    status: CollectorStatus::Pending,
                    last_value: None,
                }),
            })
            .collect();

        let index = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.source.clone(), i))
            .collect();

        let (version, _) = watch::channel(0);
        Self { slots, index, version }
    }

    /// Sets the status of `source` and, when given, its last known value.
    ///
    /// Returns `false` (and leaves the row untouched) for unknown sources
    /// and for non-monotonic transitions.
    pub fn update(&self, source: &str, status: CollectorStatus, value: Option<Decimal>) -> bool {
        let Some(&i) = self.index.get(source) else {
            warn!("status update for unknown source '{source}' ignored");
            return false;
        };

        {
            let mut state = self.slots[i]
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if !state.status.can_become(status) {
                warn!(
                    "[{source}] rejected status transition {} -> {}",
                    state.status, status
                );
                return false;
            }

            state.status = status;
            if value.is_some() {
                state.last_value = value;
            }
        }

        self.version.send_modify(|v| *v += 1);
        true
    }

    pub fn status(&self, source: &str) -> Option<CollectorStatus> {
        let i = *self.index.get(source)?;
        let state = self.slots[i].state.lock().unwrap_or_else(PoisonError::into_inner);
        Some(state.status)
    }

    /// Rows in fixed display order.
    pub fn snapshot(&self) -> Vec<BoardRow> {
        self.slots
            .iter()
            .map(|slot| {
                let state = *slot.state.lock().unwrap_or_else(PoisonError::into_inner);
                BoardRow {
                    source: slot.source.clone(),
                    status: state.status,
                    last_value: state.last_value,
                }
            })
            .collect()
    }

    /// Change notifications for a presentation layer. The value is a
    /// monotonically increasing version number.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}
