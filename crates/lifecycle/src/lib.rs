//! 生命周期控制器
//!
//! 节点与工作空间控制器、资源分配服务、费用核算以及对账流程。

pub mod allocator;
pub mod cost;
pub mod node_controller;
pub mod reconciler;
pub mod waiter;
pub mod workspace_controller;

pub use allocator::{NodeResourceUsage, ResourceAllocator, WorkspaceResourceUsage};
pub use cost::CostAccountant;
pub use node_controller::{NodeLifecycleController, NodeStatusReport};
pub use reconciler::{ReconcileReport, Reconciler};
pub use waiter::{poll_until, PollSettings};
pub use workspace_controller::WorkspaceLifecycleController;
