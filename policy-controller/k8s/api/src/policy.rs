pub mod policy_node;

pub use self::policy_node::{
    PolicyNode, PolicyNodeSpec, PolicyNodeStatus, PolicyNodeType, QuotaStatus,
};
