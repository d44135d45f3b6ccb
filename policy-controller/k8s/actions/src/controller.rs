use crate::{metrics::ActionLabels, Action, ControllerMetrics, ObjectRef, Payload, Queue, Upsert};
use hierarchy_controller_k8s_api::{
    self as k8s, Api, DeleteParams, DynamicObject, Patch, PatchParams,
};
use kubert::lease::Claim;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::watch, time};
use tracing::{debug, error, info, instrument, trace, warn};

/// The number of times a failed action is requeued before it is dropped.
pub const MAX_RETRIES: u32 = 3;

pub const FIELD_MANAGER: &str = "hierarchy-controller";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to apply {target}: {source}")]
    Apply {
        target: ObjectRef,
        #[source]
        source: k8s::Error,
    },

    #[error("failed to delete {target}: {source}")]
    Delete {
        target: ObjectRef,
        #[source]
        source: k8s::Error,
    },

    #[error("{target} timed out after {timeout:?}")]
    Timeout {
        target: ObjectRef,
        timeout: time::Duration,
    },
}

/// Applies an action against the cluster.
#[async_trait::async_trait]
pub trait Execute {
    async fn execute(&self, action: &Action) -> Result<(), Error>;
}

/// Drains the action queue, executing each action while this process holds
/// the write lease.
pub struct Controller<E = k8s::Client> {
    name: String,
    claims: watch::Receiver<Arc<Claim>>,
    queue: Queue,
    executor: E,
    timeout: time::Duration,
    metrics: ControllerMetrics,
}

// === impl Controller ===

impl<E: Execute> Controller<E> {
    pub fn new(
        name: impl ToString,
        claims: watch::Receiver<Arc<Claim>>,
        queue: Queue,
        executor: E,
        timeout: time::Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            name: name.to_string(),
            claims,
            queue,
            executor,
            timeout,
            metrics,
        }
    }

    /// Processes actions one at a time until the queue is shut down and
    /// drained.
    pub async fn run(self) {
        while let Some(action) = self.queue.get().await {
            let target = action.target().clone();
            self.process(action).await;
            self.queue.done(&target);
            self.metrics.set_queue_depth(self.queue.len());
        }
        info!("Action queue shut down");
    }

    #[instrument(skip_all, fields(target = %action.target()))]
    async fn process(&self, action: Action) {
        let target = action.target();
        if !self.claims.borrow().is_current_for(&self.name) {
            // The leader converges the cluster; a new leader resyncs.
            trace!(%action, "Not the leader; skipping");
            self.metrics.skipped();
            self.queue.forget(target);
            return;
        }

        let labels = ActionLabels::new(&action);
        let result = match time::timeout(self.timeout, self.executor.execute(&action)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                target: target.clone(),
                timeout: self.timeout,
            }),
        };

        match result {
            Ok(()) => {
                debug!(%action, "Executed");
                self.metrics.executed(&labels);
                self.queue.forget(target);
            }
            Err(error) => {
                self.metrics.failed(&labels);
                let requeues = self.queue.num_requeues(target);
                if requeues < MAX_RETRIES {
                    warn!(%error, retry = requeues + 1, "Requeueing action");
                    self.metrics.retried(&labels);
                    self.queue.add_rate_limited(action);
                } else {
                    error!(%error, retries = requeues, "Dropping action");
                    self.metrics.dropped(&labels);
                    self.queue.forget(target);
                }
            }
        }
    }
}

// === impl Execute for Client ===

#[async_trait::async_trait]
impl Execute for k8s::Client {
    async fn execute(&self, action: &Action) -> Result<(), Error> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        match action {
            Action::Upsert(Upsert { target, payload }) => {
                let api = api(self.clone(), target);
                let res = match payload {
                    Payload::Object(obj) => api.patch(&target.name, &params, &Patch::Apply(obj)).await,
                    Payload::Status(obj) => {
                        api.patch_status(&target.name, &params, &Patch::Apply(obj))
                            .await
                    }
                };
                res.map(|_| ()).map_err(|source| Error::Apply {
                    target: target.clone(),
                    source,
                })
            }

            Action::Delete(target) => {
                let api = api(self.clone(), target);
                match api.delete(&target.name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(k8s::Error::Api(rsp)) if rsp.code == 404 => {
                        debug!(%target, "Already deleted");
                        Ok(())
                    }
                    Err(source) => Err(Error::Delete {
                        target: target.clone(),
                        source,
                    }),
                }
            }
        }
    }
}

fn api(client: k8s::Client, target: &ObjectRef) -> Api<DynamicObject> {
    let ar = target.api_resource();
    match target.namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    }
}
