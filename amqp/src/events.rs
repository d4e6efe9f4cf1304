//! Explicit publish/subscribe stream for outcome notifications.
//!
//! [`EventStream`] keeps a list of subscribers, each backed by an unbounded
//! `flume` channel. Semantics:
//!
//! - No replay: a subscriber sees only events published after it subscribed.
//! - [`EventStream::complete`] is terminal and happens at most once. After it,
//!   `publish` is a no-op, existing subscribers drain what was already queued
//!   and then observe the end of the stream, and new subscribers see an
//!   already-ended stream.
//! - Subscribers that drop their receiver are pruned on the next publish.

use std::sync::{Mutex, MutexGuard, PoisonError};

struct StreamState<T> {
    subscribers: Vec<flume::Sender<T>>,
    completed: bool,
}

pub struct EventStream<T> {
    state: Mutex<StreamState<T>>,
}

impl<T: Clone> EventStream<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamState {
                subscribers: Vec::new(),
                completed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        let mut state = self.lock();
        if !state.completed {
            state.subscribers.push(tx);
        }
        rx
    }

    /// Delivers `event` to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: T) -> usize {
        let mut state = self.lock();
        if state.completed {
            return 0;
        }
        state
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        state.subscribers.len()
    }

    /// Ends the stream. Returns `false` if it had already been completed.
    pub fn complete(&self) -> bool {
        let mut state = self.lock();
        if state.completed {
            return false;
        }
        state.completed = true;
        state.subscribers.clear();
        true
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl<T: Clone> Default for EventStream<T> {
    fn default() -> Self {
        Self::new()
    }
}
