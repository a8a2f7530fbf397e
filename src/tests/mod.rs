// Test modules

pub mod common;
mod profiler_flow_test;
