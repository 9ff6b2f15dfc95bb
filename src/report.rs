use std::fmt;
use std::panic::Location;

use parking_lot::Mutex;

use crate::class::Subclass;
use crate::error::Violation;
use crate::record::RecordId;

/// Point-in-time view of a lock record for a complaint.
#[derive(Clone, Debug)]
pub struct RecordSnapshot {
    pub record: RecordId,
    pub class_name: String,
    /// Where the record's class was created.
    pub class_site: Option<&'static Location<'static>>,
    pub subclass: Subclass,
    /// Name of the exclusive owner, when there is one.
    pub owner: Option<String>,
    /// Where the current owner acquired, when known.
    pub site: Option<&'static Location<'static>>,
}

/// One held-stack frame of the complaining thread.
#[derive(Clone, Debug)]
pub struct FrameSnapshot {
    pub class_name: String,
    pub subclass: Subclass,
    pub recursion: bool,
    pub site: &'static Location<'static>,
}

/// A structured violation report: the offending record, the records it
/// clashed with (a prior-class partner or a deadlock cycle), and the full
/// held stack of the calling thread.
#[derive(Clone, Debug)]
pub struct Complaint {
    pub violation: Violation,
    pub thread: String,
    pub offending: Option<RecordSnapshot>,
    pub related: Vec<RecordSnapshot>,
    pub stack: Vec<FrameSnapshot>,
}

impl fmt::Display for Complaint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (thread {})", self.violation, self.thread)?;
        if let Some(off) = &self.offending {
            write!(f, "; acquiring {} {:?}", off.class_name, off.subclass)?;
            if let Some(site) = off.class_site {
                write!(f, " (class from {site})")?;
            }
            if let Some(site) = off.site {
                write!(f, " at {site}")?;
            }
        }
        for rel in &self.related {
            write!(f, "; involves {}", rel.class_name)?;
            if let Some(owner) = &rel.owner {
                write!(f, " (owned by {owner})")?;
            }
        }
        if !self.stack.is_empty() {
            write!(f, "; held")?;
            for frame in &self.stack {
                let tag = if frame.recursion { "+" } else { "" };
                write!(f, " {}{} [{}]", frame.class_name, tag, frame.site)?;
            }
        }
        Ok(())
    }
}

/// Receiver for structured complaints. Whether a complaint is fatal is the
/// embedder's policy; the validator only delivers it.
pub trait Sink: Send + Sync {
    fn report(&self, complaint: &Complaint);
}

/// Default sink: one `tracing` event per complaint.
pub struct TracingSink;

impl Sink for TracingSink {
    fn report(&self, complaint: &Complaint) {
        match complaint.violation {
            Violation::Deadlock { .. }
            | Violation::ExistingDeadlock
            | Violation::IllegalUpgrade => {
                tracing::error!(target: "lockvet", "{complaint}");
            }
            _ => tracing::warn!(target: "lockvet", "{complaint}"),
        }
    }
}

/// Sink that stores complaints for later inspection.
#[derive(Default)]
pub struct CollectSink {
    complaints: Mutex<Vec<Complaint>>,
}

impl CollectSink {
    pub fn new() -> Self {
        CollectSink::default()
    }

    pub fn take(&self) -> Vec<Complaint> {
        std::mem::take(&mut *self.complaints.lock())
    }

    pub fn len(&self) -> usize {
        self.complaints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for CollectSink {
    fn report(&self, complaint: &Complaint) {
        self.complaints.lock().push(complaint.clone());
    }
}
