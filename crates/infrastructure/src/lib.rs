pub mod database;
pub mod gateways;
pub mod memory;
pub mod observability;

pub use database::*;
pub use gateways::{ClusterSnapshot, FaultInjector, InMemoryClusterGateway, InMemoryNodeGateway};
pub use memory::InMemoryRepositories;
