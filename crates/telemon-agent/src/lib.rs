//! The telemon agent: polls collectors into a local cache on one ticker and
//! reports the cache to the collector server on another.

pub mod agent;
pub mod config;
pub mod pool;
pub mod sender;
