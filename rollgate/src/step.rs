//! Common-step barrier for multi-target requests.
//!
//! Every concurrently planned target group reports the step it needs, and all
//! of them wait for the least common multiple of the reports so their series
//! line up on one timeline.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::StepError;
use crate::plan::lcm;

/// How long [`CommonStepResolver::result`] waits by default.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Fold {
    expected: usize,
    received: usize,
    step: u32,
    failed: Option<StepError>,
}

impl Fold {
    fn complete(&self) -> bool {
        self.received >= self.expected
    }

    /// Keeps the first failure.
    fn fail(&mut self, err: StepError) {
        if self.failed.is_none() {
            self.failed = Some(err);
        }
    }
}

/// Folds contributed steps into their LCM and releases waiters once every
/// registered participant has reported.
///
/// A contribution of 0 counts as a report but carries no step.
///
/// # Examples
///
/// ```rust
/// use rollgate::step::CommonStepResolver;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let resolver = CommonStepResolver::default();
/// resolver.add_participants(4);
/// for step in [0, 6, 8, 10] {
///     resolver.contribute(step);
/// }
/// assert_eq!(resolver.result().await.unwrap(), 120);
/// # }
/// ```
#[derive(Debug)]
pub struct CommonStepResolver {
    fold: Mutex<Fold>,
    done: watch::Sender<bool>,
    timeout: Duration,
}

impl Default for CommonStepResolver {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_TIMEOUT)
    }
}

impl CommonStepResolver {
    /// Creates a resolver that waits at most `timeout` in
    /// [`result`](Self::result).
    pub fn new(timeout: Duration) -> Self {
        let (done, _) = watch::channel(true);
        Self {
            fold: Mutex::new(Fold::default()),
            done,
            timeout,
        }
    }

    /// Registers `n` more participants that must report.
    pub fn add_participants(&self, n: usize) {
        let mut fold = self.fold.lock();
        fold.expected += n;
        if !fold.complete() {
            self.done.send_replace(false);
        }
    }

    /// Reports one participant's step.
    ///
    /// Reports beyond the registered participant count are dropped. A step
    /// whose LCM with the steps so far overflows fails the whole barrier.
    pub fn contribute(&self, step: u32) {
        self.report(Ok(step));
    }

    /// Reports a participant that could not compute its step. Every waiter
    /// then fails with `err`.
    pub fn abandon(&self, err: StepError) {
        self.report(Err(err));
    }

    fn report(&self, step: Result<u32, StepError>) {
        let mut fold = self.fold.lock();
        if fold.complete() {
            warn!(?step, expected = fold.expected, "dropping extra step contribution");
            return;
        }
        fold.received += 1;
        match step {
            Ok(step) => match lcm(fold.step, step) {
                Some(folded) => fold.step = folded,
                None => {
                    let err = StepError::Overflow {
                        step: fold.step,
                        contribution: step,
                    };
                    warn!(error = %err, "common step overflow");
                    fold.fail(err);
                }
            },
            Err(err) => fold.fail(err),
        }
        // signalled under the lock so a concurrent registration cannot be
        // overwritten by a stale completion
        if fold.complete() {
            debug!(step = fold.step, failed = fold.failed.is_some(), "common step resolved");
            self.done.send_replace(true);
        }
    }

    /// Current LCM of the steps reported so far.
    pub fn partial(&self) -> u32 {
        self.fold.lock().step
    }

    /// Waits for every participant and returns the common step.
    ///
    /// The step is 0 when every participant reported 0.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Timeout`] if some participant has not reported
    /// within the resolver's timeout, and [`StepError::Overflow`] if the LCM
    /// does not fit in a step. A partial LCM is never returned.
    pub async fn result(&self) -> Result<u32, StepError> {
        let mut rx = self.done.subscribe();
        let released = tokio::time::timeout(self.timeout, rx.wait_for(|done| *done))
            .await
            .is_ok_and(|r| r.is_ok());

        let fold = self.fold.lock();
        if let Some(err) = &fold.failed {
            Err(err.clone())
        } else if released && fold.complete() {
            Ok(fold.step)
        } else {
            Err(StepError::Timeout {
                waited: self.timeout,
                missing: fold.expected.saturating_sub(fold.received),
            })
        }
    }
}
