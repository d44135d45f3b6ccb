//! A deduplicating work queue of actions.
//!
//! Actions are keyed by their target object. While an action is waiting, a
//! newer action for the same target replaces it, so that only the latest
//! intent is executed. An action added while its target is being processed
//! is held until the worker calls [`Queue::done`], so a single target is
//! never processed concurrently.

use crate::{Action, ObjectRef};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::{sync::Notify, time};

const BASE_DELAY: time::Duration = time::Duration::from_millis(5);
const MAX_DELAY: time::Duration = time::Duration::from_secs(1000);

#[derive(Clone, Debug, Default)]
pub struct Queue {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct State {
    order: VecDeque<ObjectRef>,
    pending: HashMap<ObjectRef, Action>,
    processing: HashSet<ObjectRef>,
    deferred: HashMap<ObjectRef, Action>,
    failures: HashMap<ObjectRef, u32>,
    /// The stamp of each target's latest intent. A retry only lands if no
    /// newer action was added for its target while it was backing off.
    generations: HashMap<ObjectRef, u64>,
    next_generation: u64,
    shutdown: bool,
}

// === impl Queue ===

impl Queue {
    /// Adds an action to the queue.
    ///
    /// The action supersedes any pending retry for its target, and the
    /// target's failure count starts over.
    ///
    /// Returns false if the queue has been shut down and the action was
    /// dropped.
    pub fn add(&self, action: Action) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            tracing::debug!(%action, "Queue shut down; dropping action");
            return false;
        }

        let target = action.target().clone();
        state.stamp(&target);
        state.failures.remove(&target);
        if state.enqueue(target, action) {
            drop(state);
            self.inner.notify.notify_one();
        }
        true
    }

    /// Adds an action after its target's backoff delay elapses.
    ///
    /// Each call counts as a failure of the target and doubles the next
    /// delay until the target is forgotten. The retry is dropped if another
    /// action is added for the target before the delay elapses.
    pub fn add_rate_limited(&self, action: Action) {
        let (delay, generation) = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            let target = action.target().clone();
            let generation = match state.generations.get(&target).copied() {
                Some(generation) => generation,
                None => state.stamp(&target),
            };
            let failures = state.failures.entry(target).or_default();
            let delay = backoff(*failures);
            *failures += 1;
            (delay, generation)
        };

        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.retry(action, generation);
        });
    }

    fn retry(&self, action: Action, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        let target = action.target().clone();
        if state.generations.get(&target) != Some(&generation) {
            tracing::debug!(%action, "Superseded by a newer action; dropping retry");
            return;
        }
        if state.enqueue(target, action) {
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Waits for the next action.
    ///
    /// Returns `None` once the queue has been shut down and all pending
    /// actions have been handed out.
    pub async fn get(&self) -> Option<Action> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                while let Some(target) = state.order.pop_front() {
                    if let Some(action) = state.pending.remove(&target) {
                        state.processing.insert(target);
                        return Some(action);
                    }
                }
                if state.shutdown {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks a target's processing as complete, releasing any action that
    /// was added for it in the meantime.
    pub fn done(&self, target: &ObjectRef) {
        let mut state = self.inner.state.lock();
        state.processing.remove(target);
        if let Some(action) = state.deferred.remove(target) {
            if state.pending.insert(target.clone(), action).is_none() {
                state.order.push_back(target.clone());
            }
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Clears a target's failure count.
    pub fn forget(&self, target: &ObjectRef) {
        let mut state = self.inner.state.lock();
        state.failures.remove(target);
        state.generations.remove(target);
    }

    /// Returns the number of times a target has been requeued after a failure.
    pub fn num_requeues(&self, target: &ObjectRef) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    /// Stops accepting new actions and wakes all waiting workers. Actions
    /// that are already queued are still handed out.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    /// Returns the number of actions waiting to be processed.
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.pending.len() + state.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// === impl State ===

impl State {
    /// Records a new intent for `target`, invalidating outstanding retries.
    fn stamp(&mut self, target: &ObjectRef) -> u64 {
        self.next_generation += 1;
        self.generations.insert(target.clone(), self.next_generation);
        self.next_generation
    }

    /// Queues `action`, deferring it if its target is in flight. Returns true
    /// if a worker should be woken.
    fn enqueue(&mut self, target: ObjectRef, action: Action) -> bool {
        if self.processing.contains(&target) {
            self.deferred.insert(target, action);
            return false;
        }
        if self.pending.insert(target.clone(), action).is_none() {
            self.order.push_back(target);
            return true;
        }
        false
    }
}

fn backoff(failures: u32) -> time::Duration {
    BASE_DELAY
        .checked_mul(2u32.saturating_pow(failures))
        .map(|d| d.min(MAX_DELAY))
        .unwrap_or(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hierarchy_controller_k8s_api::{ObjectMeta, Role};
    use pretty_assertions::assert_eq;

    fn role(ns: &str, name: &str, verb: &str) -> Action {
        let role = Role {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                annotations: Some(Some(("verb".to_string(), verb.to_string())).into_iter().collect()),
                ..Default::default()
            },
            rules: None,
        };
        Action::upsert(&role).unwrap()
    }

    #[test]
    fn backoff_doubles_until_capped() {
        assert_eq!(backoff(0), time::Duration::from_millis(5));
        assert_eq!(backoff(1), time::Duration::from_millis(10));
        assert_eq!(backoff(3), time::Duration::from_millis(40));
        assert_eq!(backoff(40), MAX_DELAY);
    }

    #[tokio::test]
    async fn deduplicates_pending_actions() {
        let queue = Queue::default();
        assert!(queue.add(role("ns-0", "a", "get")));
        assert!(queue.add(role("ns-0", "b", "get")));
        assert!(queue.add(role("ns-0", "a", "list")));
        assert_eq!(queue.len(), 2);

        // The latest intent replaces the pending one but keeps its position.
        let first = queue.get().await.unwrap();
        assert_eq!(first, role("ns-0", "a", "list"));
        let second = queue.get().await.unwrap();
        assert_eq!(second, role("ns-0", "b", "get"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn defers_actions_for_targets_in_flight() {
        let queue = Queue::default();
        queue.add(role("ns-0", "a", "get"));
        let action = queue.get().await.unwrap();

        // The target is being processed, so the new action must wait.
        queue.add(role("ns-0", "a", "list"));
        queue.shut_down();
        assert_eq!(queue.len(), 1);

        queue.done(action.target());
        assert_eq!(queue.get().await, Some(role("ns-0", "a", "list")));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let queue = Queue::default();
        let worker = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(worker.await.unwrap(), None);
        assert!(!queue.add(role("ns-0", "a", "get")));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off() {
        let queue = Queue::default();
        let action = role("ns-0", "a", "get");
        let target = action.target().clone();

        queue.add_rate_limited(action.clone());
        assert_eq!(queue.num_requeues(&target), 1);
        assert!(queue.is_empty());

        time::sleep(time::Duration::from_millis(6)).await;
        assert_eq!(queue.len(), 1);
        let got = queue.get().await.unwrap();
        queue.done(got.target());

        // The second failure waits twice as long.
        queue.add_rate_limited(action);
        time::sleep(time::Duration::from_millis(6)).await;
        assert!(queue.is_empty());
        time::sleep(time::Duration::from_millis(5)).await;
        assert_eq!(queue.len(), 1);

        queue.forget(&target);
        assert_eq!(queue.num_requeues(&target), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_actions_supersede_retries() {
        let queue = Queue::default();
        let upsert = role("ns-0", "a", "get");
        let target = upsert.target().clone();
        queue.add(upsert);

        // The upsert fails and backs off, then the object is no longer wanted.
        let failed = queue.get().await.unwrap();
        queue.add_rate_limited(failed);
        queue.done(&target);
        let delete = Action::delete::<Role>(Some("ns-0".to_string()), "a");
        queue.add(delete.clone());
        assert_eq!(queue.num_requeues(&target), 0);

        time::sleep(time::Duration::from_millis(6)).await;
        assert_eq!(queue.get().await, Some(delete));
        queue.done(&target);

        time::sleep(time::Duration::from_secs(1)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_dropped_for_superseded_deletes() {
        let queue = Queue::default();
        let delete = Action::delete::<Role>(Some("ns-0".to_string()), "a");
        let target = delete.target().clone();
        queue.add(delete);

        let failed = queue.get().await.unwrap();
        queue.add_rate_limited(failed);
        // The replacement arrives while the failed delete is still in flight.
        let upsert = role("ns-0", "a", "list");
        queue.add(upsert.clone());
        queue.done(&target);

        time::sleep(time::Duration::from_millis(6)).await;
        assert_eq!(queue.get().await, Some(upsert));
        queue.done(&target);

        time::sleep(time::Duration::from_secs(1)).await;
        assert!(queue.is_empty());
    }
}
