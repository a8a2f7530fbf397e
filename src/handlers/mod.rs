pub mod profiler;

pub use profiler::{
    collection_stats, explain_query, list_slow_queries, patterns, recommend, summary,
};
