//! The deadlock detector: a bounded depth-first walk over the live graph
//! of blocked threads and the records they wait on, with re-verification
//! of any candidate cycle before it is reported.

use std::sync::atomic::Ordering::*;

use smallvec::SmallVec;

use crate::backoff::Backoff;
use crate::record::{RecordId, RecordNode};
use crate::thread::ThreadId;
use crate::validator::Validator;

/// How deep a single walk may go before it gives up. A genuine cycle
/// through more frames than this goes undetected (a logged soft failure).
const MAX_WALK_DEPTH: usize = 64;
/// How often a walk invalidated by concurrent mutation is retried before
/// the detector declines to report.
const MAX_ATTEMPTS: usize = 4;

/// One edge of a candidate cycle: `thread` holds `record` and sleeps on
/// the next hop's record (wrapping around).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct CycleHop {
    pub record: RecordId,
    pub thread: ThreadId,
}

pub(crate) enum Outcome {
    Clear,
    Deadlock(Vec<CycleHop>),
    IllegalUpgrade(Vec<CycleHop>),
    Existing,
}

/// Run the detection walk for `origin`, which is marked as waiting on
/// `start`. The caller holds the inspection side of the gate.
pub(crate) fn detect(v: &Validator, origin: ThreadId, start: RecordId) -> Outcome {
    let mut backoff = Backoff::for_retries();
    for _ in 0..MAX_ATTEMPTS {
        match walk(v, origin, start) {
            Walk::Clear => return Outcome::Clear,
            Walk::Existing => return Outcome::Existing,
            Walk::DepthExceeded => {
                if !v.depth_warned.swap(true, Relaxed) {
                    tracing::warn!(
                        target: "lockvet",
                        "deadlock walk exceeded {MAX_WALK_DEPTH} frames; detection degraded"
                    );
                }
                return Outcome::Clear;
            }
            Walk::Candidate(cycle) => {
                if verify(v, &cycle) {
                    return if cycle.len() == 1 {
                        Outcome::IllegalUpgrade(cycle)
                    } else {
                        Outcome::Deadlock(cycle)
                    };
                }
                // The graph moved while we walked it; try again from the
                // top rather than trust a stale snapshot.
                backoff.backoff();
            }
        }
    }
    Outcome::Clear
}

enum Walk {
    Clear,
    DepthExceeded,
    Existing,
    Candidate(Vec<CycleHop>),
}

struct Hop {
    record: RecordId,
    threads: SmallVec<[ThreadId; 4]>,
    next: usize,
}

impl Hop {
    /// The owner edge this frame is currently descending through.
    fn taken(&self) -> Option<ThreadId> {
        self.next.checked_sub(1).map(|i| self.threads[i])
    }
}

fn walk(v: &Validator, origin: ThreadId, start: RecordId) -> Walk {
    let mut stack: SmallVec<[Hop; 16]> = SmallVec::new();
    let mut saw_repeat = false;

    match make_hop(v, start) {
        Some(hop) => stack.push(hop),
        None => return Walk::Clear,
    }

    while let Some(top) = stack.last_mut() {
        if top.next >= top.threads.len() {
            stack.pop();
            continue;
        }
        let thread = top.threads[top.next];
        top.next += 1;

        if thread == origin {
            let cycle = stack
                .iter()
                .map(|hop| CycleHop {
                    record: hop.record,
                    // Every frame on the path has descended at least once.
                    thread: hop.taken().unwrap_or(origin),
                })
                .collect();
            return Walk::Candidate(cycle);
        }
        if stack.iter().any(|hop| hop.taken() == Some(thread)) {
            // A cycle that does not involve the origin. Only reported when
            // the walk also runs out of room; otherwise skipped.
            saw_repeat = true;
            continue;
        }
        let Some(tn) = v.threads.get(thread.0) else { continue };
        let Some(next_record) = tn.sleeping_on() else { continue };
        if stack.len() >= MAX_WALK_DEPTH {
            return if saw_repeat { Walk::Existing } else { Walk::DepthExceeded };
        }
        if let Some(hop) = make_hop(v, next_record) {
            stack.push(hop);
        }
    }
    Walk::Clear
}

fn make_hop(v: &Validator, record: RecordId) -> Option<Hop> {
    let rec = v.records.get(record.0)?;
    Some(Hop { record, threads: owner_edges(v, &rec), next: 0 })
}

/// The sleeping threads a blocked waiter of this record is waiting for,
/// including holders of a paired sibling facet.
fn owner_edges(v: &Validator, rec: &RecordNode) -> SmallVec<[ThreadId; 4]> {
    let mut out: SmallVec<[ThreadId; 4]> = SmallVec::new();
    collect_edges(v, rec, &mut out);
    if let Some(sibling) = rec.sibling() {
        if let Some(sib) = v.records.get(sibling.0) {
            collect_edges(v, &sib, &mut out);
        }
    }
    out
}

fn collect_edges(v: &Validator, rec: &RecordNode, out: &mut SmallVec<[ThreadId; 4]>) {
    let sleeping = |t: ThreadId| v.threads.get(t.0).is_some_and(|tn| tn.sleeping_on().is_some());

    if let Some(owner) = rec.exclusive_owner() {
        if sleeping(owner) && !out.contains(&owner) {
            out.push(owner);
        }
        return;
    }
    let entries = rec.shared_entries();
    if rec.is_signaller() {
        // A signal wait cannot be "held": it only participates once every
        // waiter in the table is actually asleep.
        if entries.is_empty() || !entries.iter().all(|e| sleeping(e.thread)) {
            return;
        }
    }
    for entry in entries {
        if sleeping(entry.thread) && !out.contains(&entry.thread) {
            out.push(entry.thread);
        }
    }
}

/// Confirm that every edge of a candidate cycle still stands: each thread
/// is still an owner edge of its record and still sleeps on the next
/// record in the cycle. Anything changed means the finding is stale.
fn verify(v: &Validator, cycle: &[CycleHop]) -> bool {
    for (i, hop) in cycle.iter().enumerate() {
        let next_record = cycle[(i + 1) % cycle.len()].record;
        let Some(tn) = v.threads.get(hop.thread.0) else { return false };
        if tn.sleeping_on() != Some(next_record) {
            return false;
        }
        let Some(rec) = v.records.get(hop.record.0) else { return false };
        if !owner_edges(v, &rec).contains(&hop.thread) {
            return false;
        }
    }
    true
}
