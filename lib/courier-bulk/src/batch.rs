//! Batch accumulation.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use indexmap::IndexMap;
use tokio::time::Instant;

use crate::{budget::Reservation, record::RecordType, transform::TransformedPayload};

/// Per-type record counts.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TypeCounts(IndexMap<RecordType, u64>);

impl TypeCounts {
    /// Increments the count for the given record type.
    pub fn increment(&mut self, record_type: RecordType) {
        *self.0.entry(record_type).or_default() += 1;
    }

    /// Returns the count for the given record type.
    pub fn get(&self, record_type: RecordType) -> u64 {
        self.0.get(&record_type).copied().unwrap_or(0)
    }

    /// Returns the total count across all record types.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Returns an iterator over each record type and its count, in order of first appearance.
    pub fn iter(&self) -> impl Iterator<Item = (RecordType, u64)> + '_ {
        self.0.iter().map(|(record_type, count)| (*record_type, *count))
    }
}

/// Why a batch was flushed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushReason {
    /// The batch reached the maximum number of items.
    Full,

    /// The flush interval elapsed since the batch was opened.
    Interval,

    /// The pipeline was stopped with a partially-filled batch.
    Shutdown,
}

impl FlushReason {
    /// Returns the name of this flush reason.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Interval => "interval",
            Self::Shutdown => "shutdown",
        }
    }
}

/// An ordered collection of transformed payloads awaiting compression.
///
/// A batch holds the budget reservation for every payload it contains, which is released once the batch itself is
/// dropped.
#[derive(Debug)]
pub struct Batch {
    payloads: Vec<TransformedPayload>,
    byte_size: usize,
    counts: TypeCounts,
    opened_at: Instant,
    reservation: Option<Reservation>,
}

impl Batch {
    fn new() -> Self {
        Self {
            payloads: Vec::new(),
            byte_size: 0,
            counts: TypeCounts::default(),
            opened_at: Instant::now(),
            reservation: None,
        }
    }

    fn push(&mut self, payload: TransformedPayload, reservation: Reservation) {
        // A batch is considered open from the moment it holds its first payload.
        if self.payloads.is_empty() {
            self.opened_at = Instant::now();
        }

        self.byte_size += payload.len();
        self.counts.increment(payload.record_type());
        self.payloads.push(payload);

        match self.reservation.as_mut() {
            Some(existing) => existing.merge(reservation),
            None => self.reservation = Some(reservation),
        }
    }

    fn take(&mut self) -> Batch {
        std::mem::replace(self, Batch::new())
    }

    /// Returns the payloads in this batch, in insertion order.
    pub fn payloads(&self) -> &[TransformedPayload] {
        &self.payloads
    }

    /// Returns the number of payloads in this batch.
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Returns `true` if this batch contains no payloads.
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Returns the total size of all payloads in this batch, in bytes.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Returns the per-type counts of payloads in this batch.
    pub fn counts(&self) -> &TypeCounts {
        &self.counts
    }

    /// Returns the instant at which the first payload was added to this batch.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Returns the number of budget bytes held by this batch.
    pub fn reserved_bytes(&self) -> u64 {
        self.reservation.as_ref().map_or(0, Reservation::bytes)
    }
}

/// Result of offering a payload to an [`Accumulator`].
#[derive(Debug)]
pub enum Offer {
    /// The payload was appended and the current batch still has room.
    Appended,

    /// The payload filled the current batch, which was handed off.
    Full(Batch),

    /// The accumulator is closed. The payload was dropped, and its reservation with it.
    Closed,
}

#[derive(Debug)]
struct Slot {
    batch: Batch,
    closed: bool,
}

/// Accumulates payloads into the current batch.
///
/// Only one writer can touch the current batch at a time. Handing off a batch swaps in a fresh, empty one under the
/// same lock, so accumulation continues immediately.
///
/// Once [closed][Self::close], offered payloads are dropped until the accumulator is [opened][Self::open] again.
#[derive(Debug)]
pub struct Accumulator {
    max_items: usize,
    current: Mutex<Slot>,
}

impl Accumulator {
    /// Creates a new, open `Accumulator` that hands off batches once they hold `max_items` payloads.
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            current: Mutex::new(Slot {
                batch: Batch::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a payload to the current batch.
    ///
    /// If the batch is now full, it is handed off and returned. If the accumulator is closed, the payload is dropped.
    pub fn offer(&self, payload: TransformedPayload, reservation: Reservation) -> Offer {
        let mut slot = self.lock();
        if slot.closed {
            return Offer::Closed;
        }

        slot.batch.push(payload, reservation);
        if slot.batch.len() >= self.max_items {
            Offer::Full(slot.batch.take())
        } else {
            Offer::Appended
        }
    }

    /// Hands off the current batch if it is non-empty and was opened at least `interval` ago.
    pub fn take_if_due(&self, interval: Duration) -> Option<Batch> {
        let mut slot = self.lock();
        let batch = &mut slot.batch;
        (!batch.is_empty() && batch.opened_at.elapsed() >= interval).then(|| batch.take())
    }

    /// Hands off the current batch if it is non-empty.
    pub fn take(&self) -> Option<Batch> {
        let mut slot = self.lock();
        (!slot.batch.is_empty()).then(|| slot.batch.take())
    }

    /// Closes the accumulator and hands off the current batch if it is non-empty.
    ///
    /// Payloads offered after this returns are dropped, so the returned batch is the last one until the accumulator is
    /// opened again.
    pub fn close(&self) -> Option<Batch> {
        let mut slot = self.lock();
        slot.closed = true;
        (!slot.batch.is_empty()).then(|| slot.batch.take())
    }

    /// Opens the accumulator, accepting payloads again.
    pub fn open(&self) {
        self.lock().closed = false;
    }

    /// Returns the instant at which the current batch becomes due for an interval flush.
    ///
    /// When the current batch is empty, this is one full interval from now.
    pub fn next_deadline(&self, interval: Duration) -> Instant {
        let slot = self.lock();
        if slot.batch.is_empty() {
            Instant::now() + interval
        } else {
            slot.batch.opened_at + interval
        }
    }

    /// Returns the number of payloads in the current batch.
    pub fn pending(&self) -> usize {
        self.lock().batch.len()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::budget::ByteBudget;

    fn payload(data: &'static [u8], record_type: RecordType) -> TransformedPayload {
        TransformedPayload::new(data, record_type)
    }

    fn offer(accumulator: &Accumulator, budget: &ByteBudget, payload: TransformedPayload) -> Option<Batch> {
        let reservation = budget.try_reserve(payload.len() as u64).expect("budget should not be exhausted");
        match accumulator.offer(payload, reservation) {
            Offer::Appended => None,
            Offer::Full(batch) => Some(batch),
            Offer::Closed => panic!("accumulator should be open"),
        }
    }

    #[test]
    fn hands_off_when_full() {
        let budget = ByteBudget::new(u64::MAX);
        let accumulator = Accumulator::new(3);

        assert!(offer(&accumulator, &budget, payload(b"a", RecordType::METRICS)).is_none());
        assert!(offer(&accumulator, &budget, payload(b"bb", RecordType::LOG)).is_none());
        let batch = offer(&accumulator, &budget, payload(b"ccc", RecordType::METRICS)).expect("batch should be full");

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.byte_size(), 6);
        assert_eq!(batch.reserved_bytes(), 6);
        assert_eq!(batch.counts().get(RecordType::METRICS), 2);
        assert_eq!(batch.counts().get(RecordType::LOG), 1);
        assert_eq!(batch.counts().total(), 3);

        let order = batch.payloads().iter().map(|p| p.bytes().as_ref()).collect::<Vec<_>>();
        assert_eq!(order, vec![&b"a"[..], &b"bb"[..], &b"ccc"[..]]);

        assert_eq!(accumulator.pending(), 0);
        assert_eq!(budget.in_use(), 6);

        drop(batch);
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn take_only_non_empty() {
        let budget = ByteBudget::new(u64::MAX);
        let accumulator = Accumulator::new(10);
        assert!(accumulator.take().is_none());

        offer(&accumulator, &budget, payload(b"a", RecordType::METRICS));
        let batch = accumulator.take().expect("batch should be non-empty");
        assert_eq!(batch.len(), 1);
        assert!(accumulator.take().is_none());
    }

    #[test]
    fn closed_accumulator_drops_offers() {
        let budget = ByteBudget::new(u64::MAX);
        let accumulator = Accumulator::new(10);
        offer(&accumulator, &budget, payload(b"aa", RecordType::METRICS));

        let last = accumulator.close().expect("pending batch should be handed off");
        assert_eq!(last.len(), 1);

        let reservation = budget.try_reserve(3).expect("budget should not be exhausted");
        let dropped = accumulator.offer(payload(b"bbb", RecordType::LOG), reservation);
        assert!(matches!(dropped, Offer::Closed));
        assert_eq!(accumulator.pending(), 0);
        assert_eq!(budget.in_use(), 2);

        drop(last);
        assert_eq!(budget.in_use(), 0);
        assert!(accumulator.close().is_none());

        accumulator.open();
        offer(&accumulator, &budget, payload(b"c", RecordType::METRICS));
        assert_eq!(accumulator.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn due_after_interval() {
        let interval = Duration::from_secs(5);
        let budget = ByteBudget::new(u64::MAX);
        let accumulator = Accumulator::new(10);

        // Empty batches are never due, and the deadline simply rolls forward.
        tokio::time::advance(interval * 2).await;
        assert!(accumulator.take_if_due(interval).is_none());
        assert_eq!(accumulator.next_deadline(interval), Instant::now() + interval);

        offer(&accumulator, &budget, payload(b"a", RecordType::METRICS));
        let deadline = accumulator.next_deadline(interval);
        assert_eq!(deadline, Instant::now() + interval);

        tokio::time::advance(interval - Duration::from_millis(1)).await;
        assert!(accumulator.take_if_due(interval).is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let batch = accumulator.take_if_due(interval).expect("batch should be due");
        assert_eq!(batch.len(), 1);
    }

    proptest! {
        #[test]
        fn property_test_batch_invariants(
            max_items in 1usize..16,
            sizes in proptest::collection::vec((1usize..64, 0usize..3), 1..128),
        ) {
            const TYPES: [RecordType; 3] = [RecordType::METRICS, RecordType::LOG, RecordType::HEALTH];

            let budget = ByteBudget::new(u64::MAX);
            let accumulator = Accumulator::new(max_items);
            let mut batches = Vec::new();

            for (size, type_idx) in sizes.iter().copied() {
                let payload = TransformedPayload::new(vec![b'x'; size], TYPES[type_idx]);
                let reservation = budget.try_reserve(size as u64).expect("unbounded budget");
                if let Offer::Full(batch) = accumulator.offer(payload, reservation) {
                    batches.push(batch);
                }
            }
            batches.extend(accumulator.take());

            let mut total_items = 0;
            for batch in &batches {
                prop_assert!(batch.len() <= max_items);
                prop_assert_eq!(batch.byte_size(), batch.payloads().iter().map(TransformedPayload::len).sum::<usize>());
                prop_assert_eq!(batch.counts().total() as usize, batch.len());
                prop_assert_eq!(batch.reserved_bytes() as usize, batch.byte_size());
                total_items += batch.len();
            }
            prop_assert_eq!(total_items, sizes.len());
        }
    }
}
