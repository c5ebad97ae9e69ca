pub mod allocation;
pub mod node;
pub mod task;
pub mod workspace;

pub use allocation::{PlanType, SharedQuota, WorkspaceNodeAllocation};
pub use node::{hours_between, DedicatedNode, NodePool, NodeProvisionRequest};
pub use task::{Task, TaskKind, TaskOperation, TaskStatus, TaskTarget};
pub use workspace::Workspace;
