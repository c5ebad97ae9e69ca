pub mod mapping;
pub mod sqlite;

pub use mapping::MappingHelpers;
pub use sqlite::*;
