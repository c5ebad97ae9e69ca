//! 工作区共享的测试工具
//!
//! 以开发依赖的方式引入：
//!
//! ```toml
//! [dev-dependencies]
//! kaas-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;

pub use builders::*;
