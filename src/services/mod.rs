//! Service layer

pub mod command_monitor;
pub mod mongo_client;
pub mod persistent_profiler;
pub mod query_profiler;

pub use command_monitor::CommandMonitor;
pub use mongo_client::MongoExplainClient;
pub use persistent_profiler::PersistentQueryProfilerService;
pub use query_profiler::{ProfilerError, ProfilerSettings, QueryProfilerService};
