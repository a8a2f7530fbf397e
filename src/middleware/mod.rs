//! HTTP middleware

pub mod guard;

pub use guard::api_guard;
