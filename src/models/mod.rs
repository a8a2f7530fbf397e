pub mod profiler;

pub use profiler::*;
