//! Committed head changes, delivered to subscribers over bounded channels.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use modeset_model::HeadMask;
use parking_lot::Mutex;

use crate::state::CommittedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadChange {
    Enabled,
    Disabled,
    Reconfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModesetEvent {
    pub revision: u64,
    pub disp: usize,
    pub api_head: usize,
    pub change: HeadChange,
    pub hw_heads: HeadMask,
}

/// One event per virtual head whose committed state was replaced.
pub(crate) fn diff(before: &CommittedState, after: &CommittedState) -> Vec<ModesetEvent> {
    let mut events = Vec::new();
    for (disp, (old, new)) in before.disps.iter().zip(&after.disps).enumerate() {
        for (api_head, (old, new)) in old.api_heads.iter().zip(&new.api_heads).enumerate() {
            if Arc::ptr_eq(old, new) {
                continue;
            }
            let change = match (old.is_active(), new.is_active()) {
                (false, true) => HeadChange::Enabled,
                (true, false) => HeadChange::Disabled,
                (true, true) => HeadChange::Reconfigured,
                (false, false) => continue,
            };
            events.push(ModesetEvent {
                revision: after.revision,
                disp,
                api_head,
                change,
                hw_heads: new.hw_heads,
            });
        }
    }
    events
}

pub(crate) struct EventHub {
    capacity: usize,
    subscribers: Mutex<Vec<Sender<ModesetEvent>>>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<ModesetEvent> {
        let (sender, receiver) = bounded(self.capacity);
        self.subscribers.lock().push(sender);
        receiver
    }

    pub(crate) fn publish(&self, events: &[ModesetEvent]) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| {
            for event in events {
                match sender.try_send(*event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(
                            disp = event.disp,
                            api_head = event.api_head,
                            "event subscriber full, dropping event"
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
            true
        });
    }
}
