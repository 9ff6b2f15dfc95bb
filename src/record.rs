use std::panic::Location;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::*};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::arena::Handle;
use crate::class::{ClassId, Subclass};
use crate::error::Violation;
use crate::thread::ThreadId;

/// Bookkeeping record attached to one instrumented lock instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RecordId(pub(crate) Handle);

impl RecordId {
    pub(crate) fn pack(self) -> u64 {
        self.0.pack()
    }

    pub(crate) fn unpack(bits: u64) -> Option<RecordId> {
        Handle::unpack(bits).map(RecordId)
    }
}

/// What an ownership note did to the record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Acquired {
    /// The thread now holds the record; push a main frame.
    First,
    /// Recursion depth grew; push a recursion frame.
    Recursed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Released {
    /// The thread no longer holds the record; splice the main frame out.
    Last,
    /// Recursion depth shrank; pop one recursion frame.
    Recursion,
}

pub(crate) struct ExclusiveState {
    /// Packed ThreadId of the current owner, 0 when free. The detector
    /// reads this cross-thread.
    owner: AtomicU64,
    depth: AtomicU32,
    site: Mutex<Option<&'static Location<'static>>>,
}

/// One thread's membership in a shared record's owner table.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SharedOwner {
    pub thread: ThreadId,
    pub depth: u32,
    pub site: &'static Location<'static>,
}

pub(crate) struct SharedState {
    /// A signaller's table holds waiters being released, not concurrent
    /// holders; it only feeds the detector when every entry sleeps.
    pub signaller: bool,
    entries: Mutex<Vec<SharedOwner>>,
}

pub(crate) enum RecordKind {
    Exclusive(ExclusiveState),
    Shared(SharedState),
}

pub(crate) struct RecordNode {
    pub class: ClassId,
    pub subclass: Subclass,
    /// Packed RecordId of the paired facet when one physical lock exposes
    /// both an exclusive and a shared side, 0 otherwise.
    sibling: AtomicU64,
    pub kind: RecordKind,
}

impl RecordNode {
    pub fn new_exclusive(class: ClassId, subclass: Subclass) -> Self {
        RecordNode {
            class,
            subclass,
            sibling: AtomicU64::new(0),
            kind: RecordKind::Exclusive(ExclusiveState {
                owner: AtomicU64::new(0),
                depth: AtomicU32::new(0),
                site: Mutex::new(None),
            }),
        }
    }

    pub fn new_shared(class: ClassId, subclass: Subclass, signaller: bool) -> Self {
        RecordNode {
            class,
            subclass,
            sibling: AtomicU64::new(0),
            kind: RecordKind::Shared(SharedState {
                signaller,
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn sibling(&self) -> Option<RecordId> {
        RecordId::unpack(self.sibling.load(Acquire))
    }

    pub fn set_sibling(&self, other: RecordId) {
        self.sibling.store(other.pack(), Release);
    }

    pub fn exclusive_owner(&self) -> Option<ThreadId> {
        match &self.kind {
            RecordKind::Exclusive(ex) => Handle::unpack(ex.owner.load(Acquire)).map(ThreadId),
            RecordKind::Shared(_) => None,
        }
    }

    /// Does `thread` currently hold (or, for a signaller, wait on) this
    /// record?
    pub fn holds(&self, thread: ThreadId) -> bool {
        self.depth_of(thread) > 0
    }

    pub fn depth_of(&self, thread: ThreadId) -> u32 {
        match &self.kind {
            RecordKind::Exclusive(ex) => {
                if ex.owner.load(Acquire) == thread.pack() {
                    ex.depth.load(Acquire)
                } else {
                    0
                }
            }
            RecordKind::Shared(sh) => sh
                .entries
                .lock()
                .iter()
                .find(|e| e.thread == thread)
                .map_or(0, |e| e.depth),
        }
    }

    /// Record `thread` as owner (or as an additional shared holder).
    ///
    /// Calling this for an exclusive record another thread still owns is a
    /// contract breach by the embedding wrapper: it must have blocked (and
    /// so observed the release) first.
    pub fn note_owner(
        &self,
        thread: ThreadId,
        site: &'static Location<'static>,
    ) -> Result<Acquired, Violation> {
        match &self.kind {
            RecordKind::Exclusive(ex) => {
                match ex.owner.compare_exchange(0, thread.pack(), AcqRel, Acquire) {
                    Ok(_) => {
                        ex.depth.store(1, Release);
                        *ex.site.lock() = Some(site);
                        Ok(Acquired::First)
                    }
                    Err(cur) if cur == thread.pack() => {
                        ex.depth.fetch_add(1, AcqRel);
                        Ok(Acquired::Recursed)
                    }
                    Err(_) => Err(Violation::InternalError(
                        "exclusive record is owned by another thread",
                    )),
                }
            }
            RecordKind::Shared(sh) => {
                let mut entries = sh.entries.lock();
                match entries.iter_mut().find(|e| e.thread == thread) {
                    Some(entry) => {
                        entry.depth += 1;
                        Ok(Acquired::Recursed)
                    }
                    None => {
                        entries.try_reserve(1).map_err(|_| Violation::OutOfMemory)?;
                        entries.push(SharedOwner { thread, depth: 1, site });
                        Ok(Acquired::First)
                    }
                }
            }
        }
    }

    pub fn note_release(&self, thread: ThreadId) -> Result<Released, Violation> {
        match &self.kind {
            RecordKind::Exclusive(ex) => {
                if ex.owner.load(Acquire) != thread.pack() {
                    return Err(Violation::NotOwner);
                }
                if ex.depth.fetch_sub(1, AcqRel) == 1 {
                    *ex.site.lock() = None;
                    ex.owner.store(0, Release);
                    Ok(Released::Last)
                } else {
                    Ok(Released::Recursion)
                }
            }
            RecordKind::Shared(sh) => {
                let mut entries = sh.entries.lock();
                let Some(pos) = entries.iter().position(|e| e.thread == thread) else {
                    return Err(if sh.signaller {
                        Violation::NotSignaller
                    } else {
                        Violation::NotOwner
                    });
                };
                if entries[pos].depth == 1 {
                    entries.swap_remove(pos);
                    Ok(Released::Last)
                } else {
                    entries[pos].depth -= 1;
                    Ok(Released::Recursion)
                }
            }
        }
    }

    /// Point-in-time copy of the shared owner table. Empty for exclusive
    /// records.
    pub fn shared_entries(&self) -> SmallVec<[SharedOwner; 4]> {
        match &self.kind {
            RecordKind::Exclusive(_) => SmallVec::new(),
            RecordKind::Shared(sh) => sh.entries.lock().iter().copied().collect(),
        }
    }

    pub fn is_signaller(&self) -> bool {
        matches!(&self.kind, RecordKind::Shared(sh) if sh.signaller)
    }

    pub fn acquire_site(&self) -> Option<&'static Location<'static>> {
        match &self.kind {
            RecordKind::Exclusive(ex) => *ex.site.lock(),
            RecordKind::Shared(sh) => sh.entries.lock().first().map(|e| e.site),
        }
    }
}
