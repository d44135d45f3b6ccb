#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use hierarchy_controller_core as core;
pub use hierarchy_controller_k8s_actions as actions;
pub use hierarchy_controller_k8s_api as k8s;
pub use hierarchy_controller_k8s_index as index;

mod admission;
mod args;
mod index_list;
mod lease;

pub use self::{admission::Admission, args::Args};
