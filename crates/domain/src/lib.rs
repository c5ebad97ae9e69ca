pub mod cost;
pub mod entities;
pub mod events;
pub mod plans;
pub mod ports;
pub mod repositories;
pub mod state_machine;
pub mod value_objects;

pub use entities::*;
pub use events::{NodeEvent, NodeEventType};
pub use plans::{ClusterSizing, NodePlan, PlanCatalog, PlanLimits, StaticPlanCatalog};
pub use repositories::*;
pub use state_machine::{
    NodeAction, NodeStatus, TransitionRejected, WorkspaceAction, WorkspaceStatus,
};
pub use value_objects::{BillingPeriod, NodeSpecification, NodeType, ResourceRequest, ResourceSpec};
