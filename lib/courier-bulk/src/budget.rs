//! Byte-budget admission control.

use std::{
    fmt,
    sync::{
        atomic::{
            AtomicU64,
            Ordering::{AcqRel, Acquire},
        },
        Arc,
    },
};

use tracing::trace;

struct State {
    limit: u64,
    in_use: AtomicU64,
}

/// A process-wide budget of bytes that may be buffered or in flight at any time.
///
/// Admission is all-or-nothing: [`try_reserve`][Self::try_reserve] either grants a [`Reservation`] for the full amount
/// or rejects the request immediately. Nothing ever waits on the budget, so memory usage stays bounded regardless of
/// how quickly records are produced.
///
/// A reservation is granted when it fits within the remaining budget, or when nothing is currently reserved at all.
/// The latter rule keeps a single record larger than the whole budget from stalling the pipeline forever, and means that
/// a budget of zero bytes admits exactly one record at a time.
#[derive(Clone)]
pub struct ByteBudget {
    state: Arc<State>,
}

impl ByteBudget {
    /// Creates a new `ByteBudget` with the given limit, in bytes.
    pub fn new(limit: u64) -> Self {
        Self {
            state: Arc::new(State {
                limit,
                in_use: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the configured limit, in bytes.
    pub fn limit(&self) -> u64 {
        self.state.limit
    }

    /// Returns the number of bytes currently reserved.
    pub fn in_use(&self) -> u64 {
        self.state.in_use.load(Acquire)
    }

    /// Attempts to reserve `bytes` from the budget.
    ///
    /// Returns `None` if admitting `bytes` would exceed the limit.
    pub fn try_reserve(&self, bytes: u64) -> Option<Reservation> {
        let limit = self.state.limit;
        let result = self.state.in_use.fetch_update(AcqRel, Acquire, |in_use| {
            let next = in_use.saturating_add(bytes);
            (in_use == 0 || next <= limit).then_some(next)
        });

        match result {
            Ok(previous) => {
                trace!(bytes, in_use = previous + bytes, limit, "Reserved bytes from budget.");
                Some(Reservation {
                    state: Arc::clone(&self.state),
                    bytes,
                })
            }
            Err(in_use) => {
                trace!(bytes, in_use, limit, "Budget exhausted.");
                None
            }
        }
    }
}

impl fmt::Debug for ByteBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBudget")
            .field("limit", &self.limit())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Bytes reserved from a [`ByteBudget`].
///
/// The bytes are returned to the budget exactly once, when the reservation is released or dropped.
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation {
    state: Arc<State>,
    bytes: u64,
}

impl Reservation {
    /// Returns the number of bytes held by this reservation.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Folds `other` into this reservation, so that both are released together.
    pub fn merge(&mut self, mut other: Reservation) {
        debug_assert!(Arc::ptr_eq(&self.state, &other.state), "reservations must share a budget");
        self.bytes += std::mem::take(&mut other.bytes);
    }

    /// Releases the reserved bytes back to the budget.
    pub fn release(self) {}
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.state.in_use.fetch_sub(self.bytes, AcqRel);
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation").field("bytes", &self.bytes).finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn reserve_within_limit() {
        let budget = ByteBudget::new(100);

        let first = budget.try_reserve(60).expect("should fit");
        assert_eq!(budget.in_use(), 60);

        assert!(budget.try_reserve(50).is_none());

        let second = budget.try_reserve(40).expect("should fit exactly");
        assert_eq!(budget.in_use(), 100);

        first.release();
        assert_eq!(budget.in_use(), 40);

        drop(second);
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn oversized_reservation_admitted_when_idle() {
        let budget = ByteBudget::new(10);

        let oversized = budget.try_reserve(1000).expect("idle budget should admit anything");
        assert!(budget.try_reserve(1).is_none());

        drop(oversized);
        assert!(budget.try_reserve(1).is_some());
    }

    #[test]
    fn zero_limit_admits_one_at_a_time() {
        let budget = ByteBudget::new(0);

        let held = budget.try_reserve(20).expect("first reservation should succeed");
        for _ in 0..10 {
            assert!(budget.try_reserve(20).is_none());
        }

        drop(held);
        assert!(budget.try_reserve(20).is_some());
    }

    #[test]
    fn merged_reservations_release_once() {
        let budget = ByteBudget::new(100);

        let mut batch = budget.try_reserve(10).expect("should fit");
        batch.merge(budget.try_reserve(20).expect("should fit"));
        batch.merge(budget.try_reserve(30).expect("should fit"));
        assert_eq!(batch.bytes(), 60);
        assert_eq!(budget.in_use(), 60);

        batch.release();
        assert_eq!(budget.in_use(), 0);
    }

    proptest! {
        #[test]
        fn property_test_in_use_never_exceeds_limit_when_busy(
            limit in 1u64..10_000,
            sizes in proptest::collection::vec(1u64..2_000, 1..64),
        ) {
            let budget = ByteBudget::new(limit);
            let mut held = Vec::new();

            for size in sizes {
                if let Some(reservation) = budget.try_reserve(size) {
                    held.push(reservation);
                }

                // Only a lone reservation is allowed to push usage past the limit.
                if held.len() > 1 {
                    prop_assert!(budget.in_use() <= limit);
                }
            }

            let total: u64 = held.iter().map(Reservation::bytes).sum();
            prop_assert_eq!(budget.in_use(), total);

            drop(held);
            prop_assert_eq!(budget.in_use(), 0);
        }
    }
}
