#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
mod store;

pub use cache::{CacheStats, CachedResult, QueryCache};
pub use config::{AuditConfig, CacheConfig, RetryPolicy, StoreConfig};
pub use store::*;
