//! Capabilities the engine expects from its environment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use error_stack::Result;

use crate::client::ClockSourceId;
use crate::error::{ClockError, NotifyError};

/// Clock provider that owns the physical clocks of every client.
pub trait ClockBackend: Send + Sync {
    /// Minimum and maximum achievable rate of the clock.
    fn rate_bounds(&self, clk: ClockSourceId) -> Result<(u64, u64), ClockError>;

    /// Closest achievable rate for `target`.
    fn round_rate(&self, clk: ClockSourceId, target: u64) -> Result<u64, ClockError>;

    /// Raw rail corner required to run the clock at `rate`.
    fn voltage_for_rate(&self, clk: ClockSourceId, rate: u64) -> Result<u32, ClockError>;

    /// Program the clock to `rate`.
    fn set_rate(&self, clk: ClockSourceId, rate: u64) -> Result<(), ClockError>;
}

impl<B: ClockBackend + ?Sized> ClockBackend for Arc<B> {
    fn rate_bounds(&self, clk: ClockSourceId) -> Result<(u64, u64), ClockError> {
        (**self).rate_bounds(clk)
    }

    fn round_rate(&self, clk: ClockSourceId, target: u64) -> Result<u64, ClockError> {
        (**self).round_rate(clk, target)
    }

    fn voltage_for_rate(&self, clk: ClockSourceId, rate: u64) -> Result<u32, ClockError> {
        (**self).voltage_for_rate(clk, rate)
    }

    fn set_rate(&self, clk: ClockSourceId, rate: u64) -> Result<(), ClockError> {
        (**self).set_rate(clk, rate)
    }
}

/// Rate change forced on a client by throttling or reinstatement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateChange {
    pub client: ClockSourceId,
    pub old_rate: u64,
    pub new_rate: u64,
    /// Opaque value supplied at registration.
    pub user_data: u64,
}

/// Receives forced rate changes for one client.
///
/// Called synchronously with the engine lock held: implementations must
/// return quickly and must not call back into the engine.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, change: &RateChange) -> Result<(), NotifyError>;
}

impl<F> NotificationSink for F
where
    F: Fn(&RateChange) -> Result<(), NotifyError> + Send + Sync,
{
    fn notify(&self, change: &RateChange) -> Result<(), NotifyError> {
        self(change)
    }
}

/// Delivers `change` to `sink`, logging deliveries slower than `timeout`.
///
/// A client without a sink acknowledges every change.
pub(crate) fn deliver(
    sink: Option<&Arc<dyn NotificationSink>>,
    change: &RateChange,
    timeout: Duration,
) -> Result<(), NotifyError> {
    let Some(sink) = sink else {
        return Ok(());
    };

    let started = Instant::now();
    let outcome = sink.notify(change);
    let elapsed = started.elapsed();
    if elapsed > timeout {
        tracing::warn!(
            client = %change.client,
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "client notification exceeded timeout"
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use error_stack::report;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn change() -> RateChange {
        RateChange {
            client: ClockSourceId::new(1, 2),
            old_rate: 400,
            new_rate: 100,
            user_data: 7,
        }
    }

    #[test]
    fn missing_sink_acknowledges() {
        assert!(deliver(None, &change(), Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn closure_sink_receives_change() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let sink: Arc<dyn NotificationSink> = Arc::new(move |c: &RateChange| -> Result<(), NotifyError> {
            assert_eq!(c.user_data, 7);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        deliver(Some(&sink), &change(), Duration::from_millis(10)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn slow_sink_is_not_fatal() {
        let sink: Arc<dyn NotificationSink> = Arc::new(|_: &RateChange| -> Result<(), NotifyError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(())
        });
        assert!(deliver(Some(&sink), &change(), Duration::ZERO).is_ok());
    }

    #[test]
    fn rejection_is_propagated() {
        let sink: Arc<dyn NotificationSink> =
            Arc::new(|_: &RateChange| -> Result<(), NotifyError> {
                Err(report!(NotifyError::new("busy")))
            });
        let err = deliver(Some(&sink), &change(), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.current_context(), &NotifyError::new("busy"));
    }
}
