//! Executes reconciliation actions against the cluster.
//!
//! Syncers describe the desired state of individual objects as [`Action`]s
//! and add them to a shared [`Queue`]. A single [`Controller`] drains the
//! queue, applying each action and retrying failures with backoff.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod action;
mod controller;
mod metrics;
mod queue;


pub use self::{
    action::{Action, ObjectRef, Payload, Upsert},
    controller::{Controller, Error, Execute, FIELD_MANAGER, MAX_RETRIES},
    metrics::ControllerMetrics,
    queue::Queue,
};
