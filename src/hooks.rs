//! First-class extension hooks.
//!
//! Each extension point is an [`ActionHook`]: an ordered chain of subscribers
//! that can approve, reject, or contribute data to an operation. Subscribers
//! run in registration order under a per-hook timeout; the first rejection
//! (or timeout) aborts the chain and is surfaced verbatim to the caller.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::HookRejection;

/// A single hook subscriber.
///
/// Return `Ok(None)` to approve without contributing data, `Ok(Some(data))`
/// to approve and contribute, or `Err` to reject the operation.
#[async_trait]
pub trait HookHandler<T, D>: Send + Sync {
    /// Inspect the input and vote
    async fn run(&self, input: &T) -> Result<Option<D>, HookRejection>;
}

/// Convenience: closures returning ready results act as handlers
#[async_trait]
impl<T, D, F> HookHandler<T, D> for F
where
    T: Sync,
    D: Send,
    F: Fn(&T) -> Result<Option<D>, HookRejection> + Send + Sync,
{
    async fn run(&self, input: &T) -> Result<Option<D>, HookRejection> {
        self(input)
    }
}

/// An ordered chain of hook subscribers for one extension point
pub struct ActionHook<T, D> {
    subscribers: RwLock<Vec<(String, Arc<dyn HookHandler<T, D>>)>>,
    timeout: Duration,
}

impl<T: Sync, D: Send> ActionHook<T, D> {
    /// Create a hook with the given per-subscriber timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Register a subscriber at the end of the chain.
    ///
    /// Re-registering an id replaces the previous handler in place, keeping
    /// its position in the chain.
    pub fn subscribe(&self, id: impl Into<String>, handler: Arc<dyn HookHandler<T, D>>) {
        let id = id.into();
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = subs.iter_mut().find(|(sid, _)| *sid == id) {
            slot.1 = handler;
        } else {
            subs.push((id, handler));
        }
    }

    /// Remove a subscriber; unknown ids are ignored
    pub fn unsubscribe(&self, id: &str) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.retain(|(sid, _)| sid != id);
    }

    /// Number of registered subscribers
    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// True when no subscribers are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the chain over `input`.
    ///
    /// Contributions are collected in registration order. A rejection or a
    /// timeout aborts the chain immediately.
    pub async fn run_hooks(&self, input: &T) -> Result<Vec<D>, HookRejection> {
        let subs: Vec<_> = {
            let guard = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        let mut data = Vec::new();
        for (id, handler) in subs {
            match tokio::time::timeout(self.timeout, handler.run(input)).await {
                Ok(Ok(Some(d))) => data.push(d),
                Ok(Ok(None)) => {}
                Ok(Err(mut rejection)) => {
                    if rejection.hook_id.is_empty() {
                        rejection.hook_id = id;
                    }
                    tracing::debug!(
                        hook = rejection.hook_id,
                        reject = rejection.reject_id,
                        "hook rejected operation"
                    );
                    return Err(rejection);
                }
                Err(_) => {
                    tracing::warn!(hook = id, timeout_ms = self.timeout.as_millis() as u64, "hook timed out");
                    return Err(HookRejection {
                        hook_id: id,
                        reject_id: "timeout".into(),
                        message: "hook did not complete in time".into(),
                    });
                }
            }
        }
        Ok(data)
    }
}

impl<T: Sync, D: Send> Default for ActionHook<T, D> {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn reject(id: &str) -> HookRejection {
        HookRejection {
            hook_id: id.into(),
            reject_id: "blocked".into(),
            message: "not allowed".into(),
        }
    }

    #[tokio::test]
    async fn contributions_are_collected_in_registration_order() {
        let hook: ActionHook<u32, String> = ActionHook::default();
        hook.subscribe("b", Arc::new(|v: &u32| Ok(Some(format!("b{v}")))));
        hook.subscribe("a", Arc::new(|v: &u32| Ok(Some(format!("a{v}")))));

        let data = hook.run_hooks(&7).await.unwrap();
        assert_eq!(data, vec!["b7".to_string(), "a7".to_string()]);
    }

    #[tokio::test]
    async fn approving_without_data_contributes_nothing() {
        let hook: ActionHook<u32, String> = ActionHook::default();
        hook.subscribe("quiet", Arc::new(|_: &u32| Ok(None)));
        assert!(hook.run_hooks(&1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_rejection_aborts_the_chain() {
        let hook: ActionHook<u32, String> = ActionHook::default();
        hook.subscribe("ok", Arc::new(|_: &u32| Ok(Some("x".into()))));
        hook.subscribe("deny", Arc::new(|_: &u32| Err(reject("deny"))));
        hook.subscribe("never", Arc::new(|_: &u32| Ok(Some("y".into()))));

        let err = hook.run_hooks(&1).await.unwrap_err();
        assert_eq!(err.hook_id, "deny");
        assert_eq!(err.reject_id, "blocked");
    }

    #[tokio::test]
    async fn timeout_becomes_a_rejection_naming_the_hook() {
        struct Slow;
        #[async_trait]
        impl HookHandler<u32, String> for Slow {
            async fn run(&self, _: &u32) -> Result<Option<String>, HookRejection> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(None)
            }
        }

        let hook: ActionHook<u32, String> = ActionHook::new(Duration::from_millis(20));
        hook.subscribe("slow", Arc::new(Slow));

        let err = hook.run_hooks(&1).await.unwrap_err();
        assert_eq!(err.hook_id, "slow");
        assert_eq!(err.reject_id, "timeout");
    }

    #[tokio::test]
    async fn resubscribing_replaces_in_place_and_unsubscribe_removes() {
        let hook: ActionHook<u32, String> = ActionHook::default();
        hook.subscribe("a", Arc::new(|_: &u32| Ok(Some("old".into()))));
        hook.subscribe("b", Arc::new(|_: &u32| Ok(Some("b".into()))));
        hook.subscribe("a", Arc::new(|_: &u32| Ok(Some("new".into()))));
        assert_eq!(hook.len(), 2);

        let data = hook.run_hooks(&1).await.unwrap();
        assert_eq!(data, vec!["new".to_string(), "b".to_string()], "a keeps its slot");

        hook.unsubscribe("a");
        assert_eq!(hook.len(), 1);
    }

    #[tokio::test]
    async fn empty_chain_approves() {
        let hook: ActionHook<u32, String> = ActionHook::default();
        assert!(hook.run_hooks(&1).await.unwrap().is_empty());
    }
}
