//! Bounded retry around single browser actions.
//!
//! Transient failures (timeouts, stale handles, network) are retried with
//! fixed or incremental backoff. Anything else is structural and surfaces
//! at once. Either way, a failure that escapes leaves a DOM snapshot and a
//! screenshot behind.

use super::diagnostics::DiagnosticsRecorder;
use super::error::HarvestError;
use crate::browser::{BrowserError, BrowsingContext};
use crate::config::{BackoffKind, RetryConfig};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_retry::RetryIf;
use tokio_retry::strategy::{FibonacciBackoff, FixedInterval};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delays between attempts; one fewer than `max_attempts`.
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let retries = self.max_attempts.saturating_sub(1) as usize;
        let base_ms = self.base_delay.as_millis() as u64;
        match self.backoff {
            BackoffKind::Fixed => Box::new(FixedInterval::from_millis(base_ms).take(retries)),
            BackoffKind::Incremental => Box::new(
                FibonacciBackoff::from_millis(base_ms.max(1))
                    .max_delay(self.max_delay)
                    .take(retries),
            ),
        }
    }
}

pub struct RetryController {
    policy: RetryPolicy,
    diagnostics: DiagnosticsRecorder,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, diagnostics: DiagnosticsRecorder, cancel: CancellationToken) -> Self {
        Self {
            policy,
            diagnostics,
            cancel,
            deadline: None,
        }
    }

    /// Abort anything still running `budget` from now.
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }

    async fn interrupted(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    fn interruption(&self, action: &str) -> HarvestError {
        if self.cancel.is_cancelled() {
            HarvestError::Cancelled { action: action.to_string() }
        } else {
            HarvestError::Cancelled { action: format!("{action} (session deadline)") }
        }
    }

    /// Run `op` until it succeeds, fails structurally, or runs out of attempts.
    pub async fn run<C, T, F, Fut>(&self, ctx: &C, action: &str, mut op: F) -> Result<T, HarvestError>
    where
        C: BrowsingContext + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrowserError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(self.interruption(action));
        }

        let attempts = AtomicU32::new(0);
        let retried = RetryIf::spawn(
            self.policy.delays(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                op()
            },
            |e: &BrowserError| {
                let transient = e.is_transient();
                if transient {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        action,
                        attempts.load(Ordering::Relaxed),
                        self.policy.max_attempts,
                        e
                    );
                }
                transient
            },
        );

        let outcome = tokio::select! {
            biased;
            _ = self.interrupted() => return Err(self.interruption(action)),
            r = retried => r,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let attempts = attempts.load(Ordering::Relaxed);
        error!("{} gave up after {} attempt(s): {}", action, attempts, err);
        self.diagnostics.capture(ctx, action).await;

        if err.is_transient() {
            Err(HarvestError::TransientNavigation {
                action: action.to_string(),
                attempts,
                source: err,
            })
        } else {
            Err(HarvestError::structural(format!("{action}: {err}")))
        }
    }

    /// Structural failure found by harvester logic rather than the context.
    pub async fn fail_structural<C>(&self, ctx: &C, what: &str) -> HarvestError
    where
        C: BrowsingContext + ?Sized,
    {
        error!("Structural failure: {}", what);
        self.diagnostics.capture(ctx, what).await;
        HarvestError::structural(what)
    }

    /// Rate-limit / reload pause that still honours cancellation.
    pub async fn pause(&self, delay: Duration, action: &str) -> Result<(), HarvestError> {
        if delay.is_zero() {
            return if self.cancel.is_cancelled() { Err(self.interruption(action)) } else { Ok(()) };
        }
        tokio::select! {
            biased;
            _ = self.interrupted() => Err(self.interruption(action)),
            _ = sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fixture::{FixtureContext, FixtureFrame};
    use std::sync::atomic::AtomicUsize;
    use url::Url;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffKind::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn controller(max_attempts: u32, diagnostics: DiagnosticsRecorder) -> RetryController {
        RetryController::new(policy(max_attempts), diagnostics, CancellationToken::new())
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let ctx = FixtureContext::single(FixtureFrame::default()).fail_navigations(2);
        let url = Url::parse("https://fixture.test/").unwrap();
        let ctl = controller(3, DiagnosticsRecorder::disabled());

        ctl.run(&ctx, "navigate", || ctx.navigate(&url)).await.unwrap();
        assert_eq!(ctx.navigations(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_capture_a_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = FixtureContext::single(FixtureFrame::default()).fail_navigations(5);
        let url = Url::parse("https://fixture.test/").unwrap();
        let ctl = controller(3, DiagnosticsRecorder::to_dir(tmp.path()));

        let err = ctl.run(&ctx, "navigate", || ctx.navigate(&url)).await.unwrap_err();
        match err {
            HarvestError::TransientNavigation { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
        let files = std::fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(files, 2, "dom + screenshot");
    }

    #[tokio::test]
    async fn structural_failures_are_not_retried() {
        let ctx = FixtureContext::single(FixtureFrame::default());
        let calls = AtomicUsize::new(0);
        let ctl = controller(5, DiagnosticsRecorder::disabled());

        let err = ctl
            .run(&ctx, "enter frame", || {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err::<(), _>(BrowserError::NoSuchFrame(3)) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::StructuralParse { .. }));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_action() {
        let ctx = FixtureContext::single(FixtureFrame::default());
        let token = CancellationToken::new();
        let ctl = RetryController::new(policy(3), DiagnosticsRecorder::disabled(), token.clone());
        token.cancel();

        let err = ctl
            .run(&ctx, "wait", || std::future::pending::<Result<(), BrowserError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Cancelled { .. }));
        assert!(ctl.pause(Duration::from_secs(60), "pause").await.is_err());
    }

    #[test]
    fn incremental_delays_grow_and_are_capped() {
        let p = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffKind::Incremental,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };
        let delays: Vec<_> = p.delays().collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(250)));
    }
}
