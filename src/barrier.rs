//! Phase barriers: counting barriers with a monotonically advancing phase
//!
//! A [`PhaseBarrier`] completes its current phase once `threshold` arrivals
//! have been recorded, then starts counting for the next phase. Callers hold
//! a [`BarrierHandle`] bound to one phase; [`BarrierHandle::advance`] yields
//! the handle for the following phase without blocking.
//!
//! Arrivals for the phase after the current one are accepted early: they are
//! counted separately and only take effect once the current phase completes.
//! The phase lives in a padded atomic word so completion checks are
//! lock-free; arrival counts and waiters share one mutex.

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Largest supported arrival threshold
pub const MAX_THRESHOLD: u32 = (1 << 24) - 1;

/// Arrivals counted for the current phase and the one after it
#[derive(Debug, Default, Clone, Copy)]
struct Arrivals {
    current: u32,
    next: u32,
}

/// A reusable full/empty counting barrier
pub struct PhaseBarrier {
    /// Current (incomplete) phase
    phase: CachePadded<AtomicU64>,

    /// Arrivals needed to complete a phase
    threshold: u32,

    /// Debug label
    name: String,

    arrivals: Mutex<Arrivals>,
    completed: Condvar,
}

impl PhaseBarrier {
    /// Create a barrier at phase 0 and return the handle for phase 0
    ///
    /// # Panics
    ///
    /// Panics if `threshold` is zero or exceeds [`MAX_THRESHOLD`].
    pub fn create(name: impl Into<String>, threshold: u32) -> BarrierHandle {
        assert!(
            threshold > 0 && threshold <= MAX_THRESHOLD,
            "phase barrier threshold {threshold} out of range"
        );
        let barrier = Arc::new(Self {
            phase: CachePadded::new(AtomicU64::new(0)),
            threshold,
            name: name.into(),
            arrivals: Mutex::new(Arrivals::default()),
            completed: Condvar::new(),
        });
        BarrierHandle { barrier, phase: 0 }
    }

    /// Current (incomplete) phase
    pub fn phase(&self) -> u64 {
        self.phase.load(Ordering::Acquire)
    }

    /// Arrivals recorded so far for the current phase
    pub fn arrivals(&self) -> u32 {
        self.arrivals.lock().current
    }

    /// Arrivals already recorded for the phase after the current one
    pub fn early_arrivals(&self) -> u32 {
        self.arrivals.lock().next
    }

    /// Arrivals needed to complete a phase
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Debug label
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one arrival for `phase`
    ///
    /// Returns `true` if this arrival completed the current phase. An early
    /// arrival for the next phase never does; it is carried over when the
    /// current phase completes, which may complete that phase at once.
    ///
    /// # Panics
    ///
    /// Panics if `phase` is neither the current phase nor the one after it,
    /// or if a phase receives more than `threshold` arrivals.
    fn arrive(&self, phase: u64) -> bool {
        let mut counts = self.arrivals.lock();
        let current = self.phase.load(Ordering::Acquire);
        if phase == current + 1 {
            assert!(
                counts.next < self.threshold,
                "barrier '{}': too many early arrivals for phase {phase}",
                self.name
            );
            counts.next += 1;
            trace!(barrier = %self.name, phase, "early arrival");
            return false;
        }
        assert_eq!(
            current, phase,
            "barrier '{}': arrival for phase {phase} while at phase {current}",
            self.name
        );

        counts.current += 1;
        if counts.current < self.threshold {
            return false;
        }
        let mut done = current;
        loop {
            done += 1;
            counts.current = std::mem::take(&mut counts.next);
            if counts.current < self.threshold {
                break;
            }
        }
        self.phase.store(done, Ordering::Release);
        trace!(barrier = %self.name, from = current, to = done, "phase complete");
        self.completed.notify_all();
        true
    }

    /// Block until `phase` has completed
    fn wait(&self, phase: u64) {
        if self.phase() > phase {
            return;
        }
        let mut guard = self.arrivals.lock();
        while self.phase() <= phase {
            self.completed.wait(&mut guard);
        }
    }
}

impl fmt::Debug for PhaseBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = *self.arrivals.lock();
        f.debug_struct("PhaseBarrier")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .field("arrivals", &counts.current)
            .field("early_arrivals", &counts.next)
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// A reference to one phase of a [`PhaseBarrier`]
#[derive(Debug, Clone)]
pub struct BarrierHandle {
    barrier: Arc<PhaseBarrier>,
    phase: u64,
}

impl BarrierHandle {
    /// Phase this handle is bound to
    pub fn phase(&self) -> u64 {
        self.phase
    }

    /// The underlying barrier
    pub fn barrier(&self) -> &PhaseBarrier {
        &self.barrier
    }

    /// Arrive on this handle's phase
    ///
    /// Returns `true` if this arrival completed the phase.
    pub fn arrive(&self) -> bool {
        self.barrier.arrive(self.phase)
    }

    /// Block until this handle's phase has completed
    pub fn wait(&self) {
        self.barrier.wait(self.phase);
    }

    /// Whether this handle's phase has completed
    pub fn is_complete(&self) -> bool {
        self.barrier.phase() > self.phase
    }

    /// Handle for the next phase of the same barrier
    pub fn advance(&self) -> BarrierHandle {
        BarrierHandle {
            barrier: Arc::clone(&self.barrier),
            phase: self.phase + 1,
        }
    }

    /// Whether both handles refer to the same barrier
    pub fn same_barrier(&self, other: &BarrierHandle) -> bool {
        Arc::ptr_eq(&self.barrier, &other.barrier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_phase_completes_at_threshold() {
        let handle = PhaseBarrier::create("t", 3);
        assert!(!handle.arrive());
        assert!(!handle.arrive());
        assert!(!handle.is_complete());
        assert_eq!(handle.barrier().arrivals(), 2);
        assert!(handle.arrive());
        assert!(handle.is_complete());
        assert_eq!(handle.barrier().phase(), 1);
        assert_eq!(handle.barrier().arrivals(), 0);
    }

    #[test]
    fn test_advance_does_not_block() {
        let h0 = PhaseBarrier::create("t", 1);
        let h1 = h0.advance();
        let h2 = h1.advance();
        assert_eq!(h2.phase(), 2);
        assert!(h0.same_barrier(&h2));
        assert!(!h1.is_complete());
    }

    #[test]
    fn test_wait_on_completed_phase_returns() {
        let h0 = PhaseBarrier::create("t", 1);
        h0.arrive();
        h0.wait();
        h0.advance().arrive();
        h0.wait();
        assert_eq!(h0.barrier().phase(), 2);
    }

    #[test]
    fn test_waiter_is_released_by_last_arrival() {
        let h0 = PhaseBarrier::create("t", 2);
        let waiter = {
            let h = h0.clone();
            thread::spawn(move || {
                h.wait();
                h.barrier().phase()
            })
        };
        thread::sleep(Duration::from_millis(20));
        h0.arrive();
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        h0.arrive();
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn test_next_phase_waiter_is_independent() {
        let h0 = PhaseBarrier::create("t", 1);
        let h1 = h0.advance();
        let late = {
            let h = h1.clone();
            thread::spawn(move || h.wait())
        };
        h0.arrive();
        h0.wait();
        thread::sleep(Duration::from_millis(20));
        assert!(!late.is_finished());
        h1.arrive();
        late.join().unwrap();
    }

    #[test]
    fn test_early_arrival_counts_toward_next_phase() {
        let h0 = PhaseBarrier::create("t", 2);
        let h1 = h0.advance();
        assert!(!h0.arrive());
        assert!(!h1.arrive());
        // Phase 0 still needs its second arrival.
        assert!(!h0.is_complete());
        assert_eq!(h0.barrier().arrivals(), 1);
        assert_eq!(h0.barrier().early_arrivals(), 1);

        assert!(h0.arrive());
        assert!(h0.is_complete());
        assert!(!h1.is_complete());
        assert_eq!(h0.barrier().arrivals(), 1);
        assert_eq!(h0.barrier().early_arrivals(), 0);

        assert!(h1.arrive());
        assert_eq!(h0.barrier().phase(), 2);
    }

    #[test]
    fn test_full_early_phase_completes_with_current() {
        let h0 = PhaseBarrier::create("t", 1);
        let h1 = h0.advance();
        assert!(!h1.arrive());
        assert_eq!(h0.barrier().phase(), 0);
        assert!(h0.arrive());
        assert!(h1.is_complete());
        assert_eq!(h0.barrier().phase(), 2);
        assert_eq!(h0.barrier().arrivals(), 0);
    }

    #[test]
    #[should_panic(expected = "arrival for phase 2 while at phase 0")]
    fn test_arrival_two_phases_ahead_rejected() {
        let h0 = PhaseBarrier::create("t", 2);
        h0.advance().advance().arrive();
    }

    #[test]
    #[should_panic(expected = "arrival for phase 0 while at phase 1")]
    fn test_arrival_for_completed_phase_rejected() {
        let h0 = PhaseBarrier::create("t", 1);
        h0.arrive();
        h0.arrive();
    }

    #[test]
    #[should_panic(expected = "too many early arrivals")]
    fn test_early_arrivals_bounded_by_threshold() {
        let h1 = PhaseBarrier::create("t", 1).advance();
        h1.arrive();
        h1.arrive();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_zero_threshold_rejected() {
        PhaseBarrier::create("t", 0);
    }
}
