#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Leaf components of the `inngate` lookup gateway: the persistent TTL cache,
//! the sliding-window rate limiter, the global circuit breaker, the per-user
//! quota, and the reply classifier with its safe-projection rules.
//!
//! Everything here is engine-agnostic; the pipeline in `inngate-engine` wires
//! these pieces around the upstream conversation driver.

pub mod breaker;
pub mod cache;
pub mod classify;
pub mod limiter;
pub mod quota;
