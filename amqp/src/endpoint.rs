//! Endpoint state machine shared by connections, sessions and links.
//!
//! Every endpoint moves through `Uninitialized -> Active -> Closed`, with a
//! direct `Uninitialized -> Closed` when the peer refuses it. `Closed` is
//! terminal. Observers use a `watch` channel, so a late subscriber always sees
//! the latest state and a closed endpoint reports exactly one terminal state.

use crate::common::{AmqpError, AmqpResult};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointState {
    Uninitialized,
    Active,
    /// Closed locally (`None`) or by an error.
    Closed(Option<AmqpError>),
}

impl EndpointState {
    pub fn is_active(&self) -> bool {
        matches!(self, EndpointState::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, EndpointState::Closed(_))
    }

    pub fn closing_error(&self) -> Option<AmqpError> {
        match self {
            EndpointState::Closed(Some(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: &EndpointState) -> bool {
        match (self, next) {
            (EndpointState::Closed(_), _) => false,
            (EndpointState::Uninitialized, EndpointState::Uninitialized) => false,
            (EndpointState::Active, EndpointState::Uninitialized) => false,
            (EndpointState::Active, EndpointState::Active) => false,
            _ => true,
        }
    }
}

/// Writer side of an endpoint's state, owned by the event loop.
#[derive(Debug)]
pub struct EndpointStateTracker {
    tx: watch::Sender<EndpointState>,
}

impl EndpointStateTracker {
    pub fn new() -> (Self, EndpointStates) {
        let (tx, rx) = watch::channel(EndpointState::Uninitialized);
        (Self { tx }, EndpointStates { rx })
    }

    /// Applies `next` if the transition is legal. Returns whether it changed.
    pub fn transition(&self, next: EndpointState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub fn activate(&self) -> bool {
        self.transition(EndpointState::Active)
    }

    pub fn close(&self, error: Option<AmqpError>) -> bool {
        self.transition(EndpointState::Closed(error))
    }

    pub fn current(&self) -> EndpointState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> EndpointStates {
        EndpointStates {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reader side of an endpoint's state.
#[derive(Debug, Clone)]
pub struct EndpointStates {
    rx: watch::Receiver<EndpointState>,
}

impl EndpointStates {
    pub fn current(&self) -> EndpointState {
        self.rx.borrow().clone()
    }

    /// Waits for the next state change. Returns `None` once the writer is gone
    /// and no further change can happen.
    pub async fn changed(&mut self) -> Option<EndpointState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Resolves once the endpoint is active.
    ///
    /// # Errors
    ///
    /// Fails with the closing error (or a disposed error) if the endpoint
    /// closes first, including when the state writer has been dropped.
    pub async fn wait_active(&mut self) -> AmqpResult<()> {
        let state = self
            .rx
            .wait_for(|state| !matches!(state, EndpointState::Uninitialized))
            .await
            .map(|state| (*state).clone())
            .map_err(|_| AmqpError::disposed("Endpoint dropped before becoming active"))?;

        match state {
            EndpointState::Active => Ok(()),
            EndpointState::Closed(Some(error)) => Err(error),
            _ => Err(AmqpError::disposed("Endpoint closed before becoming active")),
        }
    }

    /// [`wait_active`](Self::wait_active) bounded by `timeout`.
    pub async fn wait_active_timeout(&mut self, timeout: Duration) -> AmqpResult<()> {
        tokio::time::timeout(timeout, self.wait_active()).await?
    }

    /// Resolves once the endpoint is closed and returns its closing error.
    pub async fn wait_closed(&mut self) -> Option<AmqpError> {
        match self.rx.wait_for(EndpointState::is_closed).await {
            Ok(state) => match &*state {
                EndpointState::Closed(error) => error.clone(),
                _ => None,
            },
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorCondition;

    #[test]
    fn test_closed_is_terminal() {
        let (tracker, states) = EndpointStateTracker::new();
        assert!(tracker.activate());
        assert!(!tracker.activate());
        assert!(tracker.close(None));

        let error = AmqpError::transport(ErrorCondition::LinkDetachForced, "forced");
        assert!(!tracker.close(Some(error)));
        assert!(!tracker.activate());
        assert_eq!(states.current(), EndpointState::Closed(None));
    }

    #[tokio::test]
    async fn test_wait_active_resolves() {
        let (tracker, mut states) = EndpointStateTracker::new();
        let waiter = tokio::spawn(async move { states.wait_active().await });
        tracker.activate();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_active_fails_when_closed_first() {
        let (tracker, mut states) = EndpointStateTracker::new();
        let error = AmqpError::transport(ErrorCondition::NotFound, "no such address");
        tracker.close(Some(error.clone()));

        assert_eq!(states.wait_active().await, Err(error));
    }

    #[tokio::test]
    async fn test_wait_active_fails_when_tracker_dropped() {
        let (tracker, mut states) = EndpointStateTracker::new();
        drop(tracker);
        assert!(states.wait_active().await.is_err());
    }
}
