//! The order checker: static vetting of every acquisition attempt against
//! the calling thread's held stack and the class partial order.

use std::time::Duration;

use smallvec::SmallVec;

use crate::class::ClassId;
use crate::error::Violation;
use crate::record::RecordId;
use crate::thread::ThreadId;
use crate::validator::Validator;

/// Vet acquiring `record` on `thread`. Never blocks; the caller already
/// holds the accounting side of the gate.
pub(crate) fn check_acquire(
    v: &Validator,
    thread: ThreadId,
    record: RecordId,
    expected_wait: Option<Duration>,
) -> Result<(), Violation> {
    let Some(rec) = v.records.get(record.0) else {
        return Err(Violation::InternalError("order check on a retired record"));
    };
    let Some(class) = v.classes.get(rec.class) else {
        // The class was torn down under us; nothing left to check against.
        return Ok(());
    };
    if let Some(wait) = expected_wait {
        if class.policy.min_order_check_wait > wait {
            return Ok(());
        }
    }
    let Some(tn) = v.threads.get(thread.0) else {
        return Err(Violation::InternalError("order check for an unknown thread"));
    };

    // Re-entry of a record the thread already holds is recursion, not an
    // ordering question.
    if tn.holds_record(record) {
        if class.policy.recursion_ok {
            return Ok(());
        }
        return v.complain(
            Violation::NestedNotAllowed { class: class.name.clone() },
            thread,
            Some(record),
            &[record],
        );
    }

    let mut checked: SmallVec<[ClassId; 8]> = SmallVec::new();
    let mut missing: SmallVec<[ClassId; 8]> = SmallVec::new();
    for frame in tn.snapshot_stack() {
        let Some(held) = v.records.get(frame.record.0) else { continue };
        if checked.contains(&held.class) {
            continue;
        }
        checked.push(held.class);

        if held.class == rec.class {
            if rec.subclass.outranks(held.subclass) {
                continue;
            }
            // Same class, no distinguishing subclass order: unrecoverable.
            return v.complain(
                wrong_order(v, rec.class, held.class),
                thread,
                Some(record),
                &[frame.record],
            );
        }
        if v.classes.is_prior(rec.class, held.class) {
            continue;
        }
        if v.classes.is_prior_transitive(held.class, rec.class) {
            // The incoming class is already known to come before the held
            // one; this acquisition contradicts the established order.
            return v.complain(
                wrong_order(v, rec.class, held.class),
                thread,
                Some(record),
                &[frame.record],
            );
        }
        if class.policy.autolearn {
            missing.push(held.class);
        } else {
            return v.complain(
                wrong_order(v, rec.class, held.class),
                thread,
                Some(record),
                &[frame.record],
            );
        }
    }

    if !missing.is_empty() {
        match v.classes.teach_batch(rec.class, &missing) {
            Ok(()) => {}
            // Teaching is advisory; an allocation failure skips it rather
            // than failing the acquisition.
            Err(Violation::OutOfMemory) => {
                tracing::debug!(target: "lockvet", "rule teaching skipped: out of memory");
            }
            // Another thread taught a conflicting rule since our scan.
            Err(conflict) => return v.complain(conflict, thread, Some(record), &[]),
        }
    }
    Ok(())
}

/// Vet releasing `record`. Only classes with strict release order care.
pub(crate) fn check_release(
    v: &Validator,
    thread: ThreadId,
    record: RecordId,
) -> Result<(), Violation> {
    let Some(rec) = v.records.get(record.0) else {
        return Err(Violation::InternalError("release check on a retired record"));
    };
    let Some(class) = v.classes.get(rec.class) else {
        return Ok(());
    };
    if !class.policy.strict_release {
        return Ok(());
    }
    let Some(tn) = v.threads.get(thread.0) else {
        return Err(Violation::InternalError("release check for an unknown thread"));
    };
    if !tn.holds_record(record) {
        return v.complain(Violation::NotOwner, thread, Some(record), &[]);
    }
    match tn.top_record() {
        Some(top) if top == record => Ok(()),
        Some(top) => {
            let blocking = v
                .records
                .get(top.0)
                .map_or_else(|| "<retired record>".into(), |r| v.classes.name_of(r.class));
            v.complain(
                Violation::WrongReleaseOrder {
                    releasing: class.name.clone(),
                    blocking,
                },
                thread,
                Some(record),
                &[top],
            )
        }
        None => v.complain(Violation::NotOwner, thread, Some(record), &[]),
    }
}

fn wrong_order(v: &Validator, acquiring: ClassId, held: ClassId) -> Violation {
    Violation::WrongOrder {
        acquiring: v.classes.name_of(acquiring),
        held: v.classes.name_of(held),
    }
}
