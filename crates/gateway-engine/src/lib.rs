#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process lookup gateway for `inngate` (admission, scheduling, upstream
//! conversation driving, batch execution).

/// Public API for the gateway crate.
pub mod api;

mod batch;
mod driver;
mod engine;
mod ingress;
mod worker;
mod xlsx;

#[cfg(test)]
mod testing;

pub use api::{
    FileHandle, GatewayConfig, GatewayDeps, GatewayEvent, GatewayHandle, Ingress, IngressPayload,
    IngressUpdate, JobResult, MessageRef, Status, UpstreamError, UpstreamEvent, UpstreamMessage,
    UpstreamTransport, start_gateway,
};
