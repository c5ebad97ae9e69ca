pub mod pool;
pub mod retry;
pub mod task_engine;

pub use pool::{PollSummary, WorkerPool, WorkerPoolBuilder};
pub use retry::RetryPolicy;
pub use task_engine::{TaskEngine, TaskOutcome};
