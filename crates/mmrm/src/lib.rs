//! Admission control and throttling for clocks sharing one current budget.
//!
//! Clients register against clock sources described by a [`PlatformConfig`]
//! and request rates through a [`ResourceEngine`]. Each request is priced with
//! the client's [`CostModel`]; requests that would push the shared rail over
//! its peak current threshold are rejected, or, for high priority clients,
//! admitted after demoting a throttle-eligible client to its lowest level.
//! Demoted clients are restored once headroom returns.

pub mod admission;
pub mod backend;
pub mod client;
pub mod config;
pub mod cost_model;
pub mod engine;
pub mod error;
pub mod level;
mod reinstate;
pub mod throttle;

#[cfg(test)]
mod testing;

pub use admission::SystemBudget;
pub use backend::{ClockBackend, NotificationSink, RateChange};
pub use client::{ClientDescriptor, ClientHandle, ClockSourceId, Priority, RegistrationPolicy};
pub use config::{ClientConfig, PlatformConfig, ScalingFactors};
pub use cost_model::CostModel;
pub use engine::{ClientSnapshot, EngineSnapshot, RateRange, ResourceEngine};
pub use error::{ClockError, MmrmError, NotifyError};
pub use level::VoltageLevel;
pub use throttle::ThrottleRecord;
