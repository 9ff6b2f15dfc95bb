use std::sync::atomic::{AtomicU64, Ordering::*};

use parking_lot::{Condvar, Mutex};

/// The two admission kinds. Any number of entrants of one kind may be
/// inside at once; the two kinds are never inside together.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Phase {
    /// Ordinary acquire/release accounting.
    Account,
    /// Detection walks and record teardown.
    Inspect,
}

const ACCOUNT_ONE: u64 = 1;
const INSPECT_ONE: u64 = 1 << 32;

fn split(bits: u64) -> (u32, u32) {
    (bits as u32, (bits >> 32) as u32)
}

/// Dual-direction admission barrier.
///
/// Both admission counters live in one atomic word so an entrant can test
/// the opposite side and bump its own side in a single compare-exchange.
/// A kind admits new entrants only while the opposite counter is zero; a
/// draining side wakes the opposite wait queue when it reaches zero. Entry
/// is lock-free once a side is admitted; the mutex and condvars exist only
/// for parking.
pub(crate) struct PhaseGate {
    counts: AtomicU64,
    park: Mutex<()>,
    account_cv: Condvar,
    inspect_cv: Condvar,
}

impl PhaseGate {
    pub fn new() -> Self {
        PhaseGate {
            counts: AtomicU64::new(0),
            park: Mutex::new(()),
            account_cv: Condvar::new(),
            inspect_cv: Condvar::new(),
        }
    }

    pub fn enter(&self, phase: Phase) -> PhaseGuard<'_> {
        loop {
            if self.try_enter(phase) {
                return PhaseGuard { gate: self, phase };
            }
            let mut parked = self.park.lock();
            // Re-check with the parking lock held so an exit draining the
            // opposite side cannot notify between the check and the wait.
            if self.opposed(phase) {
                match phase {
                    Phase::Account => self.account_cv.wait(&mut parked),
                    Phase::Inspect => self.inspect_cv.wait(&mut parked),
                }
            }
        }
    }

    fn try_enter(&self, phase: Phase) -> bool {
        let mut cur = self.counts.load(Acquire);
        loop {
            let (account, inspect) = split(cur);
            let (opposite, one) = match phase {
                Phase::Account => (inspect, ACCOUNT_ONE),
                Phase::Inspect => (account, INSPECT_ONE),
            };
            if opposite != 0 {
                return false;
            }
            match self.counts.compare_exchange_weak(cur, cur + one, AcqRel, Acquire) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    fn opposed(&self, phase: Phase) -> bool {
        let (account, inspect) = split(self.counts.load(Acquire));
        match phase {
            Phase::Account => inspect != 0,
            Phase::Inspect => account != 0,
        }
    }

    fn exit(&self, phase: Phase) {
        let one = match phase {
            Phase::Account => ACCOUNT_ONE,
            Phase::Inspect => INSPECT_ONE,
        };
        let prev = self.counts.fetch_sub(one, AcqRel);
        let (account, inspect) = split(prev);
        let drained = match phase {
            Phase::Account => account == 1,
            Phase::Inspect => inspect == 1,
        };
        if drained {
            let _parked = self.park.lock();
            match phase {
                Phase::Account => self.inspect_cv.notify_all(),
                Phase::Inspect => self.account_cv.notify_all(),
            };
        }
    }
}

pub(crate) struct PhaseGuard<'a> {
    gate: &'a PhaseGate,
    phase: Phase,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.gate.exit(self.phase);
    }
}
