//! Bounded retries with exponential backoff.

use std::{panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt as _;
use rand::Rng;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    compression::CompressedBatch,
    generic_error,
    sender::{SendError, Sender},
};

/// Delay schedule between send attempts.
///
/// The delay before retry `n` (counting from 1) is `initial * 2^(n-1)`, capped at `max`. With a jitter of `j`, each
/// delay is shortened by a uniformly random amount of up to `j` times its length, but never below `initial`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` without jitter.
    ///
    /// If `max` is lower than `initial`, it is raised to match.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: 0.0,
        }
    }

    /// Sets the jitter, as a fraction of each delay between 0.0 and 1.0.
    ///
    /// Out-of-range values are clamped, and 0.0 disables jitter.
    pub fn with_jitter(self, jitter: f64) -> Self {
        let jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
        Self { jitter, ..self }
    }

    /// Returns the delay before the first retry.
    pub const fn initial_delay(&self) -> Duration {
        self.initial
    }

    /// Returns the upper bound of any delay.
    pub const fn max_delay(&self) -> Duration {
        self.max
    }

    /// Returns the un-jittered delay before the given retry.
    ///
    /// Retry 0 is treated as retry 1.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1);
        let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Returns the delay before the given retry, drawing jitter from `rng`.
    pub fn delay<G>(&self, retry: u32, rng: &mut G) -> Duration
    where
        G: Rng + ?Sized,
    {
        let base = self.base_delay(retry);
        if self.jitter == 0.0 {
            return base;
        }

        let cut = self.jitter * rng.random::<f64>();
        base.mul_f64(1.0 - cut).max(self.initial)
    }
}

/// Determines whether a failed send should be retried.
pub trait RetryClassifier: Send + Sync {
    /// Returns `true` if the send that produced `error` should be attempted again.
    fn should_retry(&self, error: &SendError) -> bool;
}

/// Classifier that retries only errors marked as retryable.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardClassifier;

impl RetryClassifier for StandardClassifier {
    fn should_retry(&self, error: &SendError) -> bool {
        error.is_retryable()
    }
}

/// Terminal outcome of sending one batch.
#[derive(Debug)]
pub enum SendOutcome {
    /// The batch was delivered.
    Delivered {
        /// Number of send attempts made.
        attempts: u32,
    },

    /// The sink rejected the batch with a non-retryable error.
    Rejected {
        /// Number of send attempts made.
        attempts: u32,
        /// Last send error.
        error: SendError,
    },

    /// Every allowed retry failed.
    Exhausted {
        /// Number of send attempts made.
        attempts: u32,
        /// Last send error.
        error: SendError,
    },

    /// The pipeline shut down before the batch could be retried.
    Abandoned {
        /// Number of send attempts made.
        attempts: u32,
    },
}

impl SendOutcome {
    /// Returns the number of send attempts made.
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts }
            | Self::Rejected { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Abandoned { attempts } => *attempts,
        }
    }

    /// Returns `true` if the batch was delivered.
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Retry policy for sending batches.
///
/// A batch is attempted once, and then retried up to `max_retries` more times while the classifier considers the
/// failure retryable, waiting for the backoff duration between attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy<C = StandardClassifier> {
    max_retries: u32,
    backoff: ExponentialBackoff,
    classifier: C,
}

impl RetryPolicy {
    /// Creates a new `RetryPolicy` with the standard classifier.
    pub fn new(max_retries: u32, backoff: ExponentialBackoff) -> Self {
        Self::with_classifier(max_retries, backoff, StandardClassifier)
    }
}

impl<C> RetryPolicy<C>
where
    C: RetryClassifier,
{
    /// Creates a new `RetryPolicy` with the given classifier.
    pub fn with_classifier(max_retries: u32, backoff: ExponentialBackoff, classifier: C) -> Self {
        Self {
            max_retries,
            backoff,
            classifier,
        }
    }

    /// Returns the maximum number of retries after the initial attempt.
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Sends `batch`, retrying according to this policy until a terminal outcome is reached.
    ///
    /// Once `shutdown` is cancelled, no further attempts are started: a pending backoff is cut short and the batch is
    /// abandoned. An attempt that is already in progress is allowed to finish.
    ///
    /// A sender that panics is treated as having failed with a retryable error.
    pub async fn send<S>(&self, sender: &S, batch: &CompressedBatch, shutdown: &CancellationToken) -> SendOutcome
    where
        S: Sender + ?Sized,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let result = match AssertUnwindSafe(sender.send(batch)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(SendError::retryable(generic_error!("sender panicked during send"))),
            };

            let error = match result {
                Ok(()) => return SendOutcome::Delivered { attempts },
                Err(error) => error,
            };

            if !self.classifier.should_retry(&error) {
                return SendOutcome::Rejected { attempts, error };
            }

            // Attempt `n` is followed by retry `n`.
            if attempts > self.max_retries {
                return SendOutcome::Exhausted { attempts, error };
            }

            if shutdown.is_cancelled() {
                return SendOutcome::Abandoned { attempts };
            }

            let delay = self.backoff.delay(attempts, &mut rand::rng());
            debug!(attempts, ?delay, %error, "Retrying batch with backoff.");

            select! {
                _ = sleep(delay) => {},
                _ = shutdown.cancelled() => return SendOutcome::Abandoned { attempts },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering::Relaxed},
            Arc, Mutex,
        },
    };

    use async_trait::async_trait;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng as _};
    use tokio::time::Instant;

    use super::*;
    use crate::batch::TypeCounts;

    enum Step {
        Ok,
        Retryable,
        NonRetryable,
        Panic,
    }

    struct ScriptedSender {
        steps: Mutex<VecDeque<Step>>,
        fallback: fn() -> Step,
        calls: AtomicU32,
    }

    impl ScriptedSender {
        fn new(steps: Vec<Step>, fallback: fn() -> Step) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                fallback,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Relaxed)
        }
    }

    #[async_trait]
    impl Sender for ScriptedSender {
        async fn send(&self, _: &CompressedBatch) -> Result<(), SendError> {
            self.calls.fetch_add(1, Relaxed);
            let step = self.steps.lock().unwrap().pop_front().unwrap_or_else(self.fallback);
            match step {
                Step::Ok => Ok(()),
                Step::Retryable => Err(SendError::retryable(generic_error!("unavailable"))),
                Step::NonRetryable => Err(SendError::non_retryable(generic_error!("bad request"))),
                Step::Panic => panic!("sender exploded"),
            }
        }
    }

    fn batch() -> CompressedBatch {
        CompressedBatch::new(&b"payload"[..], TypeCounts::default())
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_delivers() {
        let sender = ScriptedSender::new(vec![Step::Retryable, Step::Retryable], || Step::Ok);
        let outcome = policy(5).send(&sender, &batch(), &CancellationToken::new()).await;

        assert!(outcome.is_delivered());
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(sender.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_is_not_retried() {
        let sender = ScriptedSender::new(vec![], || Step::NonRetryable);
        let outcome = policy(5).send(&sender, &batch(), &CancellationToken::new()).await;

        assert!(matches!(outcome, SendOutcome::Rejected { attempts: 1, .. }));
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries() {
        let sender = ScriptedSender::new(vec![], || Step::Retryable);
        let started = Instant::now();
        let outcome = policy(5).send(&sender, &batch(), &CancellationToken::new()).await;

        assert!(matches!(outcome, SendOutcome::Exhausted { attempts: 6, .. }));
        assert_eq!(sender.calls(), 6);

        // 100ms, 200ms, 400ms, 800ms, then capped at 1s.
        assert_eq!(started.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_single_attempt() {
        let sender = ScriptedSender::new(vec![], || Step::Retryable);
        let outcome = policy(0).send(&sender, &batch(), &CancellationToken::new()).await;

        assert!(matches!(outcome, SendOutcome::Exhausted { attempts: 1, .. }));
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_retryable() {
        let sender = ScriptedSender::new(vec![Step::Panic], || Step::Ok);
        let outcome = policy(3).send(&sender, &batch(), &CancellationToken::new()).await;

        assert!(outcome.is_delivered());
        assert_eq!(sender.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_pending_retry() {
        let sender = Arc::new(ScriptedSender::new(vec![], || Step::Retryable));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let sender = Arc::clone(&sender);
            let shutdown = shutdown.clone();
            async move { policy(5).send(sender.as_ref(), &batch(), &shutdown).await }
        });

        // Let the first attempt fail and the task park in its backoff sleep.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sender.calls(), 1);

        shutdown.cancel();
        let outcome = task.await.expect("task should not panic");
        assert!(matches!(outcome, SendOutcome::Abandoned { attempts: 1 }));
        assert_eq!(sender.calls(), 1);
    }

    #[test]
    fn inverted_bounds_are_corrected() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.max_delay(), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(10), Duration::from_secs(2));
    }

    #[test]
    fn schedule_doubles_from_initial_delay() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays = (0..=6).map(|retry| backoff.base_delay(retry).as_millis()).collect::<Vec<_>>();
        assert_eq!(delays, vec![100, 100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn huge_retry_counts_saturate_at_max_delay() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(u64::MAX / 2), Duration::MAX);
        assert_eq!(backoff.base_delay(u32::MAX), Duration::MAX);
    }

    #[test]
    fn jitter_is_clamped() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_secs(1));
        let mut rng = StdRng::seed_from_u64(7);

        let none = backoff.with_jitter(f64::NAN);
        assert_eq!(none.delay(4, &mut rng), none.base_delay(4));
        assert_eq!(backoff.with_jitter(-3.0).delay(4, &mut rng), backoff.base_delay(4));

        let full = backoff.with_jitter(12.0);
        assert!(full.delay(4, &mut rng) <= full.base_delay(4));
    }

    fn arb_exponential_backoff() -> impl Strategy<Value = ExponentialBackoff> {
        (1u64..=u64::MAX, 1u64..u64::MAX).prop_map(|(initial, extra)| {
            let max = initial.saturating_add(extra);
            ExponentialBackoff::new(Duration::from_nanos(initial), Duration::from_nanos(max))
        })
    }

    proptest! {
        #[test]
        fn property_test_schedule_is_monotonic(
            backoff in arb_exponential_backoff(),
            retry in 1..u32::MAX,
            later in 1..5u32,
        ) {
            let first = backoff.base_delay(retry);
            let second = backoff.base_delay(retry.saturating_add(later));

            prop_assert_eq!(first, backoff.delay(retry, &mut rand::rng()));
            prop_assert!(first <= second);
            prop_assert!(first >= backoff.initial_delay());
            prop_assert!(second <= backoff.max_delay());
        }

        #[test]
        fn property_test_jittered_delay_is_bounded(
            seed in any::<u64>(),
            retry in 1..64u32,
            jitter in 0.0..=1.0f64,
        ) {
            let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(60)).with_jitter(jitter);
            let mut rng = StdRng::seed_from_u64(seed);

            let jittered = backoff.delay(retry, &mut rng);
            prop_assert!(jittered >= backoff.initial_delay());
            prop_assert!(jittered <= backoff.base_delay(retry));
        }
    }
}
