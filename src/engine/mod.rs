// ObjectDB Engine - Core module structure
pub mod cli;
pub mod config;
pub mod connection;
pub mod console;
pub mod migration;
pub mod query;
pub mod store;

pub use config::Config;
pub use connection::{Connection, ConnectionError, ConnectionState, ConstructionError, OpenError};
pub use console::{LogSink, MemorySink, TracingSink};
pub use migration::{Migration, MigrationError, MigrationOp, MigrationRegistry, MigrationStep};
pub use query::{Query, QueryError};
