//! The bulk processor and its background tasks.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use arc_swap::ArcSwapOption;
use snafu::{ResultExt as _, Snafu};
use tokio::{
    runtime::{Handle, TryCurrentError},
    select,
    sync::Semaphore,
    time::{sleep_until, timeout_at, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    batch::{Accumulator, Batch, FlushReason, Offer},
    budget::ByteBudget,
    compression::{BatchCompressor, CompressedBatch},
    config::{BulkConfiguration, BulkConfigurationError},
    record::{Record, RecordValidity, Validator},
    retry::{RetryPolicy, SendOutcome},
    sender::Sender,
    telemetry::{BatchDropReason, RecordDropReason, Telemetry},
    transform::Transformer,
};

/// Bulk processor errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ProcessorError {
    /// The configuration was invalid.
    #[snafu(display("invalid bulk processor configuration: {}", source))]
    InvalidConfiguration {
        /// Error source.
        source: BulkConfigurationError,
    },

    /// The processor was started outside of a Tokio runtime.
    #[snafu(display("bulk processor must be started from within a Tokio runtime: {}", source))]
    NoRuntime {
        /// Error source.
        source: TryCurrentError,
    },

    /// The processor was started while still draining from a previous stop.
    #[snafu(display("bulk processor cannot be started while it is still draining"))]
    StillDraining,
}

/// Lifecycle state of a [`BulkProcessor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineState {
    /// Not accepting records.
    Stopped,

    /// Accepting records and flushing batches.
    Running,

    /// No longer accepting records, and waiting for in-flight sends to finish.
    Draining,
}

/// State that lives for a single start/stop cycle.
struct RunContext {
    runtime: Handle,
    shutdown: CancellationToken,
    timer: CancellationToken,
    tasks: TaskTracker,
}

/// State shared between the processor and its background tasks.
struct Shared<C, S> {
    config: BulkConfiguration,
    compressor: C,
    sender: S,
    retry_policy: RetryPolicy,
    budget: ByteBudget,
    accumulator: Accumulator,
    send_slots: Semaphore,
    telemetry: Telemetry,
}

impl<C, S> Shared<C, S>
where
    C: BatchCompressor,
    S: Sender,
{
    async fn compress(&self, batch: &Batch) -> Option<CompressedBatch> {
        match self.compressor.compress(batch).await {
            Ok(compressed) => Some(compressed),
            Err(e) => {
                error!(
                    records = batch.len(),
                    bytes = batch.byte_size(),
                    error = %e,
                    "Failed to compress batch. Dropping."
                );
                self.telemetry.batch_dropped(BatchDropReason::CompressionFailure);
                None
            }
        }
    }

    fn finish(&self, batch: Batch, compressed: &CompressedBatch, outcome: SendOutcome) {
        let records = compressed.record_count();
        self.telemetry.send_attempts(outcome.attempts());

        match outcome {
            SendOutcome::Delivered { attempts } => {
                debug!(records, compressed_len = compressed.bytes().len(), attempts, "Batch delivered.");
                self.telemetry.batch_sent(records, compressed.bytes().len());
            }
            SendOutcome::Rejected { attempts, error } => {
                error!(records, attempts, %error, "Batch rejected by sink. Dropping.");
                self.telemetry.batch_dropped(BatchDropReason::NonRetryable);
            }
            SendOutcome::Exhausted { attempts, error } => {
                error!(records, attempts, %error, "Batch failed after exhausting all retries. Dropping.");
                self.telemetry.batch_dropped(BatchDropReason::RetriesExhausted);
            }
            SendOutcome::Abandoned { attempts } => {
                warn!(records, attempts, "Batch abandoned during shutdown.");
                self.telemetry.batch_dropped(BatchDropReason::Shutdown);
            }
        }

        // Dropping the batch hands its reservation back to the budget.
        drop(batch);
    }
}

/// Bulk reporting pipeline.
///
/// Records handed to [`process`][Self::process] are validated, transformed, and admitted against the byte budget
/// before being appended to the current batch. Batches are flushed when they reach the configured number of items or
/// when the flush interval elapses, and are then compressed and sent on background tasks, with bounded concurrency
/// and retries.
///
/// Nothing in the pipeline ever surfaces an error to the producer: records and batches that cannot make progress are
/// dropped, logged, and counted.
pub struct BulkProcessor<R, T, C, S> {
    shared: Arc<Shared<C, S>>,
    transformer: T,
    validator: Box<dyn Validator<R>>,
    state: Mutex<PipelineState>,
    run: ArcSwapOption<RunContext>,
}

impl<R, T, C, S> BulkProcessor<R, T, C, S>
where
    R: Record + 'static,
    T: Transformer<R>,
    C: BatchCompressor + 'static,
    S: Sender + 'static,
{
    /// Creates a new `BulkProcessor`.
    ///
    /// Records are validated with [`Record::is_valid`] unless a different validator is set with
    /// [`with_validator`][Self::with_validator].
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn new(config: BulkConfiguration, transformer: T, compressor: C, sender: S) -> Result<Self, ProcessorError> {
        let budget = ByteBudget::new(config.max_budget_bytes());
        Self::with_budget(config, budget, transformer, compressor, sender)
    }

    /// Creates a new `BulkProcessor` that admits records against the given byte budget.
    ///
    /// The budget may be shared with other processors, in which case `bulk_max_budget` is ignored and the limit
    /// of the given budget applies to all of them together.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn with_budget(
        config: BulkConfiguration, budget: ByteBudget, transformer: T, compressor: C, sender: S,
    ) -> Result<Self, ProcessorError> {
        config.validate().context(InvalidConfiguration)?;

        let shared = Shared {
            retry_policy: config.retry_policy(),
            budget,
            accumulator: Accumulator::new(config.max_items()),
            send_slots: Semaphore::new(config.max_concurrent_sends()),
            telemetry: Telemetry::register(),
            compressor,
            sender,
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            transformer,
            validator: Box::new(RecordValidity),
            state: Mutex::new(PipelineState::Stopped),
            run: ArcSwapOption::empty(),
        })
    }

    /// Sets the validator used to reject records before they are transformed.
    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Validator<R> + 'static,
    {
        self.validator = Box::new(validator);
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> PipelineState {
        *self.lock_state()
    }

    /// Returns the byte budget shared by all batches.
    pub fn budget(&self) -> &ByteBudget {
        &self.shared.budget
    }

    /// Returns the number of records in the batch currently being accumulated.
    pub fn pending_records(&self) -> usize {
        self.shared.accumulator.pending()
    }

    /// Starts the processor.
    ///
    /// Background tasks are spawned on the current Tokio runtime. Starting a processor that is already running does
    /// nothing.
    ///
    /// # Errors
    ///
    /// If called outside of a Tokio runtime, or while the processor is still draining, an error is returned.
    pub fn start(&self) -> Result<(), ProcessorError> {
        let runtime = Handle::try_current().context(NoRuntime)?;

        let mut state = self.lock_state();
        match *state {
            PipelineState::Running => {
                debug!("Bulk processor already running.");
                return Ok(());
            }
            PipelineState::Draining => return StillDraining.fail(),
            PipelineState::Stopped => {}
        }

        let shutdown = CancellationToken::new();
        let ctx = Arc::new(RunContext {
            runtime,
            timer: shutdown.child_token(),
            shutdown,
            tasks: TaskTracker::new(),
        });

        self.shared.accumulator.open();
        ctx.tasks
            .spawn_on(run_flush_timer(Arc::clone(&self.shared), Arc::clone(&ctx)), &ctx.runtime);
        self.run.store(Some(ctx));
        *state = PipelineState::Running;

        let config = &self.shared.config;
        info!(
            max_items = config.max_items(),
            flush_interval = ?config.flush_interval(),
            max_concurrent_sends = config.max_concurrent_sends(),
            max_retries = config.max_retries(),
            max_budget_bytes = self.shared.budget.limit(),
            "Bulk processor started."
        );

        Ok(())
    }

    /// Processes a single record.
    ///
    /// Never blocks on I/O: the record is either appended to the current batch or dropped. When appending the record
    /// fills the batch, the batch is handed off to a background task for compression and sending.
    pub fn process(&self, record: R) {
        let telemetry = &self.shared.telemetry;
        telemetry.record_received();

        let Some(ctx) = self.run.load_full() else {
            trace!("Bulk processor not running. Dropping record.");
            telemetry.record_dropped(RecordDropReason::NotRunning);
            return;
        };

        if !self.validator.validate(&record) {
            debug!(record_type = %record.record_type(), "Record failed validation. Dropping.");
            telemetry.record_dropped(RecordDropReason::Invalid);
            return;
        }

        let payload = match self.transformer.transform(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(record_type = %record.record_type(), error = %e, "Failed to transform record. Dropping.");
                telemetry.record_dropped(RecordDropReason::TransformFailure);
                return;
            }
        };

        let Some(reservation) = self.shared.budget.try_reserve(payload.len() as u64) else {
            debug!(
                payload_len = payload.len(),
                in_use = self.shared.budget.in_use(),
                limit = self.shared.budget.limit(),
                "Byte budget exhausted. Dropping record."
            );
            telemetry.record_dropped(RecordDropReason::BudgetExhausted);
            return;
        };

        match self.shared.accumulator.offer(payload, reservation) {
            Offer::Appended => {}
            Offer::Full(batch) => {
                // The batch belongs to whichever run is current, which differs from `ctx` after a restart.
                let ctx = self.run.load_full().unwrap_or(ctx);
                dispatch(&self.shared, &ctx, batch, FlushReason::Full);
            }
            Offer::Closed => {
                trace!("Bulk processor stopped while the record was in flight. Dropping record.");
                telemetry.record_dropped(RecordDropReason::NotRunning);
            }
        }
    }

    /// Stops the processor.
    ///
    /// Admission stops immediately and the flush timer is cancelled. Batches waiting for a send slot are dropped and
    /// pending retries are abandoned. The partially-filled batch is then either sent with a single attempt or
    /// discarded, depending on `bulk_flush_on_stop`. Sends already in progress, and the final batch, share the drain
    /// timeout. No new send attempts are started for batches flushed before the call.
    ///
    /// Stopping a processor that is not running does nothing.
    pub async fn stop(&self) {
        let ctx = {
            let mut state = self.lock_state();
            if *state != PipelineState::Running {
                debug!(state = ?*state, "Bulk processor not running. Ignoring stop.");
                return;
            }
            *state = PipelineState::Draining;
            self.run.swap(None)
        };

        info!("Stopping bulk processor.");

        if let Some(ctx) = ctx {
            ctx.timer.cancel();
            let last = self.shared.accumulator.close();

            // Retrying sends give up their slots here, so the final batch never waits behind a backoff.
            ctx.shutdown.cancel();
            ctx.tasks.close();

            let deadline = Instant::now() + self.shared.config.drain_timeout();
            if let Some(batch) = last {
                if self.shared.config.flush_on_stop() {
                    dispatch_final(&self.shared, batch, deadline).await;
                } else {
                    debug!(records = batch.len(), "Discarding partially-filled batch.");
                    self.shared.telemetry.batch_dropped(BatchDropReason::Shutdown);
                }
            }

            if timeout_at(deadline, ctx.tasks.wait()).await.is_err() {
                warn!(
                    in_flight = ctx.tasks.len(),
                    "Timed out waiting for in-flight sends to finish. Abandoning them."
                );
            }
        }

        *self.lock_state() = PipelineState::Stopped;
        info!("Bulk processor stopped.");
    }
}

impl<R, T, C, S> fmt::Debug for BulkProcessor<R, T, C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkProcessor")
            .field("state", &*self.state.lock().unwrap_or_else(PoisonError::into_inner))
            .field("budget", &self.shared.budget)
            .finish_non_exhaustive()
    }
}

impl<R, T, C, S> Drop for BulkProcessor<R, T, C, S> {
    fn drop(&mut self) {
        if let Some(ctx) = self.run.swap(None) {
            ctx.shutdown.cancel();
        }
    }
}

fn dispatch<C, S>(shared: &Arc<Shared<C, S>>, ctx: &RunContext, batch: Batch, reason: FlushReason)
where
    C: BatchCompressor + 'static,
    S: Sender + 'static,
{
    debug!(
        records = batch.len(),
        bytes = batch.byte_size(),
        reason = reason.as_str(),
        "Flushing batch."
    );
    shared.telemetry.batch_flushed(reason, batch.len());

    ctx.tasks
        .spawn_on(ship(Arc::clone(shared), batch, ctx.shutdown.clone()), &ctx.runtime);
}

async fn ship<C, S>(shared: Arc<Shared<C, S>>, batch: Batch, shutdown: CancellationToken)
where
    C: BatchCompressor,
    S: Sender,
{
    if shutdown.is_cancelled() {
        debug!(records = batch.len(), "Bulk processor stopping. Dropping batch.");
        shared.telemetry.batch_dropped(BatchDropReason::Shutdown);
        return;
    }

    let Some(compressed) = shared.compress(&batch).await else {
        return;
    };

    let _permit = select! {
        biased;

        _ = shutdown.cancelled() => {
            debug!(records = batch.len(), "Bulk processor stopping before a send slot was available. Dropping batch.");
            shared.telemetry.batch_dropped(BatchDropReason::Shutdown);
            return;
        },
        permit = shared.send_slots.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                error!("Send slots closed unexpectedly. Dropping batch.");
                shared.telemetry.batch_dropped(BatchDropReason::Shutdown);
                return;
            }
        },
    };

    let outcome = shared.retry_policy.send(&shared.sender, &compressed, &shutdown).await;
    shared.finish(batch, &compressed, outcome);
}

/// Sends the batch left over at shutdown with a single attempt.
async fn dispatch_final<C, S>(shared: &Shared<C, S>, batch: Batch, deadline: Instant)
where
    C: BatchCompressor,
    S: Sender,
{
    debug!(
        records = batch.len(),
        bytes = batch.byte_size(),
        reason = FlushReason::Shutdown.as_str(),
        "Flushing batch."
    );
    shared.telemetry.batch_flushed(FlushReason::Shutdown, batch.len());

    let Some(compressed) = shared.compress(&batch).await else {
        return;
    };

    let _permit = match timeout_at(deadline, shared.send_slots.acquire()).await {
        Ok(Ok(permit)) => permit,
        _ => {
            warn!(records = batch.len(), "No send slot available before the drain timeout. Dropping final batch.");
            shared.telemetry.batch_dropped(BatchDropReason::Shutdown);
            return;
        }
    };

    // An already-cancelled token limits the policy to the initial attempt.
    let no_retries = CancellationToken::new();
    no_retries.cancel();

    let outcome = shared.retry_policy.send(&shared.sender, &compressed, &no_retries).await;
    shared.finish(batch, &compressed, outcome);
}

async fn run_flush_timer<C, S>(shared: Arc<Shared<C, S>>, ctx: Arc<RunContext>)
where
    C: BatchCompressor + 'static,
    S: Sender + 'static,
{
    let interval = shared.config.flush_interval();
    debug!(?interval, "Flush timer started.");

    loop {
        let deadline = shared.accumulator.next_deadline(interval);

        select! {
            _ = ctx.timer.cancelled() => break,
            _ = sleep_until(deadline) => {
                if let Some(batch) = shared.accumulator.take_if_due(interval) {
                    dispatch(&shared, &ctx, batch, FlushReason::Interval);
                }
            }
        }
    }

    debug!("Flush timer stopped.");
}
