//! Correlation registry for asynchronous results
//!
//! A caller registers interest in a result, hands the token to an external
//! party and waits. The external party later resolves the token. Every wait
//! carries a timeout; a waiter that gives up removes its registration so a
//! late resolution is reported as unmatched.

use crate::{Error, Result};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Pending results keyed by token
#[derive(Debug)]
pub struct FutureRegistry<T> {
    pending: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> Default for FutureRegistry<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Send + 'static> FutureRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending result
    pub fn create(self: &Arc<Self>) -> (String, Waiter<T>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let token = loop {
            let token = new_token();
            if !pending.contains_key(&token) {
                break token;
            }
        };
        pending.insert(token.clone(), tx);
        drop(pending);

        let waiter = Waiter {
            token: token.clone(),
            rx,
            registry: Arc::clone(self),
        };
        (token, waiter)
    }

    /// Deliver `value` to the waiter registered under `token`.
    ///
    /// Returns `false` when no live waiter holds the token.
    pub fn resolve(&self, token: &str, value: T) -> bool {
        let sender = self.pending.lock().remove(token);
        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => {
                tracing::debug!(token = token, "Resolve for unknown or expired token");
                false
            }
        }
    }
}

impl<T> FutureRegistry<T> {
    /// Drop a registration; its waiter observes `Cancelled`
    pub fn cancel(&self, token: &str) -> bool {
        self.pending.lock().remove(token).is_some()
    }

    /// Registrations still waiting
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Receiving side of a registration
///
/// Dropping a waiter, waited on or not, removes its registration.
#[derive(Debug)]
pub struct Waiter<T> {
    token: String,
    rx: oneshot::Receiver<T>,
    registry: Arc<FutureRegistry<T>>,
}

impl<T: Send + 'static> Waiter<T> {
    /// Correlation token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wait for the result, at most `timeout`
    pub async fn wait(mut self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::WithdrawTimedOut(timeout)),
        }
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        self.registry.cancel(&self.token);
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers() {
        let registry = Arc::new(FutureRegistry::<u32>::new());
        let (token, waiter) = registry.create();
        assert_eq!(token.len(), 16);
        assert_eq!(registry.pending(), 1);

        assert!(registry.resolve(&token, 7));
        assert_eq!(waiter.wait(Duration::from_secs(1)).await.unwrap(), 7);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_timeout_unregisters() {
        let registry = Arc::new(FutureRegistry::<u32>::new());
        let (token, waiter) = registry.create();

        let err = waiter.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::WithdrawTimedOut(_)));
        assert_eq!(registry.pending(), 0);
        // Late result finds nobody
        assert!(!registry.resolve(&token, 1));
    }

    #[tokio::test]
    async fn test_cancel() {
        let registry = Arc::new(FutureRegistry::<u32>::new());
        let (token, waiter) = registry.create();
        assert!(registry.cancel(&token));
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_dropped_waiter_unregisters() {
        let registry = Arc::new(FutureRegistry::<u32>::new());
        let (token, waiter) = registry.create();
        let (_other, _kept) = registry.create();
        assert_eq!(registry.pending(), 2);

        drop(waiter);
        assert_eq!(registry.pending(), 1);
        assert!(!registry.resolve(&token, 1));
    }

    #[test]
    fn test_unknown_token() {
        let registry = Arc::new(FutureRegistry::<u32>::new());
        assert!(!registry.resolve("0000000000000000", 1));
    }
}
