use std::cell::RefCell;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering::*};

use parking_lot::Mutex;

use crate::arena::Handle;
use crate::error::Violation;
use crate::record::{RecordId, Released};

/// A thread session registered with one validator context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId(pub(crate) Handle);

impl ThreadId {
    pub(crate) fn pack(self) -> u64 {
        self.0.pack()
    }
}

const RUNNING: u8 = 0;
const BLOCKED: u8 = 1;

/// One frame of the per-thread held stack. The head is the vector's tail.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Frame {
    pub record: RecordId,
    /// Re-entry of a record already on the stack; popped on the matching
    /// release without touching the main frame.
    pub recursion: bool,
    pub site: &'static Location<'static>,
}

/// Per-thread bookkeeping. The stack is mutated only by the owning thread;
/// the detector reads the atomics (and snapshots the stack) cross-thread
/// under the inspection side of the gate.
pub(crate) struct ThreadNode {
    pub name: String,
    state: AtomicU8,
    /// Packed RecordId this thread is about to block on, 0 when none.
    blocked_on: AtomicU64,
    stack: Mutex<Vec<Frame>>,
}

impl ThreadNode {
    pub fn new(name: String) -> Self {
        ThreadNode {
            name,
            state: AtomicU8::new(RUNNING),
            blocked_on: AtomicU64::new(0),
            stack: Mutex::new(Vec::new()),
        }
    }

    pub fn set_blocked(&self, record: RecordId) {
        self.blocked_on.store(record.pack(), Release);
        self.state.store(BLOCKED, Release);
    }

    pub fn clear_blocked(&self) {
        self.state.store(RUNNING, Release);
        self.blocked_on.store(0, Release);
    }

    /// The record this thread sleeps on, if it is in fact sleeping.
    pub fn sleeping_on(&self) -> Option<RecordId> {
        if self.state.load(Acquire) != BLOCKED {
            return None;
        }
        RecordId::unpack(self.blocked_on.load(Acquire))
    }

    pub fn push_frame(&self, record: RecordId, recursion: bool, site: &'static Location<'static>) {
        self.stack.lock().push(Frame { record, recursion, site });
    }

    /// Drop the stack frame matching a release. A recursion release pops
    /// the topmost recursion frame for the record; a final release splices
    /// the main frame out, wherever interleaved releases left it.
    pub fn drop_frame(&self, record: RecordId, released: Released) -> Result<(), Violation> {
        let mut stack = self.stack.lock();
        let pos = stack
            .iter()
            .rposition(|f| f.record == record && (f.recursion == matches!(released, Released::Recursion)));
        match pos {
            Some(pos) => {
                stack.remove(pos);
                Ok(())
            }
            None => Err(Violation::InternalError("held stack out of sync with record")),
        }
    }

    pub fn top_record(&self) -> Option<RecordId> {
        self.stack.lock().last().map(|f| f.record)
    }

    pub fn held_count(&self) -> usize {
        self.stack.lock().len()
    }

    pub fn holds_record(&self, record: RecordId) -> bool {
        self.stack.lock().iter().any(|f| f.record == record)
    }

    /// Copy of the stack, top first.
    pub fn snapshot_stack(&self) -> Vec<Frame> {
        let stack = self.stack.lock();
        stack.iter().rev().copied().collect()
    }
}

// The sync wrappers resolve "the current OS thread" to a session lazily.
// A thread may talk to several validator contexts, so the cache maps
// context ids to sessions.
thread_local! {
    static SESSIONS: RefCell<Vec<(u64, ThreadId)>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn cached_session(ctx: u64) -> Option<ThreadId> {
    SESSIONS.with(|s| {
        s.borrow().iter().find(|(c, _)| *c == ctx).map(|(_, id)| *id)
    })
}

pub(crate) fn cache_session(ctx: u64, id: ThreadId) {
    SESSIONS.with(|s| s.borrow_mut().push((ctx, id)));
}

pub(crate) fn evict_session(ctx: u64, id: ThreadId) {
    SESSIONS.with(|s| s.borrow_mut().retain(|&(c, t)| c != ctx || t != id));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u32) -> RecordId {
        RecordId(Handle { idx: n, gen: 1 })
    }

    #[test]
    fn frames_splice_out_of_order() {
        let node = ThreadNode::new("t".into());
        let here = Location::caller();
        node.push_frame(record(1), false, here);
        node.push_frame(record(2), false, here);
        node.push_frame(record(3), false, here);

        // Releasing the middle record leaves the outer two stacked.
        node.drop_frame(record(2), Released::Last).unwrap();
        assert_eq!(node.held_count(), 2);
        assert_eq!(node.top_record(), Some(record(3)));
        assert!(!node.holds_record(record(2)));
    }

    #[test]
    fn recursion_frames_pop_before_main() {
        let node = ThreadNode::new("t".into());
        let here = Location::caller();
        node.push_frame(record(1), false, here);
        node.push_frame(record(2), false, here);
        node.push_frame(record(1), true, here);

        node.drop_frame(record(1), Released::Recursion).unwrap();
        assert!(node.holds_record(record(1)));
        node.drop_frame(record(1), Released::Last).unwrap();
        assert!(!node.holds_record(record(1)));
        assert_eq!(node.held_count(), 1);

        assert!(node.drop_frame(record(9), Released::Last).is_err());
    }

    #[test]
    fn sleep_marker_round_trip() {
        let node = ThreadNode::new("t".into());
        assert_eq!(node.sleeping_on(), None);
        node.set_blocked(record(4));
        assert_eq!(node.sleeping_on(), Some(record(4)));
        node.clear_blocked();
        assert_eq!(node.sleeping_on(), None);
    }
}
