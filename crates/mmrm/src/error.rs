use derive_more::Display;

/// Error kinds surfaced by the resource engine.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum MmrmError {
    /// Handle does not refer to a live registration.
    #[display("invalid client handle")]
    InvalidHandle,
    /// Hardware block count is not in the client's compatibility list.
    #[display("unsupported hardware block count {count}")]
    InvalidHwBlockCount { count: u32 },
    /// Requested rate is above every level ceiling of the client.
    #[display("rate {rate_hz} Hz exceeds client maximum {max_hz} Hz")]
    RateOutOfRange { rate_hz: u64, max_hz: u64 },
    /// Granting the request would exceed the peak current threshold.
    #[display("peak current budget exceeded: {prospective_ma} mA >= {threshold_ma} mA")]
    BudgetExceeded {
        prospective_ma: i64,
        threshold_ma: u64,
    },
    /// Clock backend failed to apply a rate.
    #[display("clock backend failed")]
    BackendError,
    /// Clock source is already registered and cannot be shared.
    #[display("no free registration slot")]
    NoFreeRegistrationSlot,
    /// Clock source is not part of the platform description.
    #[display("unknown client key")]
    UnknownClientKey,
    /// Platform description is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl core::error::Error for MmrmError {}

impl MmrmError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

/// Failure reported by a [`ClockBackend`](crate::ClockBackend).
#[derive(Debug, Display, Clone, PartialEq, Eq)]
#[display("clock operation failed: {reason}")]
pub struct ClockError {
    pub reason: String,
}

impl core::error::Error for ClockError {}

impl ClockError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Rejection returned by a [`NotificationSink`](crate::NotificationSink).
#[derive(Debug, Display, Clone, PartialEq, Eq)]
#[display("rate change rejected: {reason}")]
pub struct NotifyError {
    pub reason: String,
}

impl core::error::Error for NotifyError {}

impl NotifyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
