use thiserror::Error;

/// Everything the validator can complain about.
///
/// Checks return these to the instrumented primitive's wrapper; the wrapper
/// decides whether a violation aborts the real acquisition. The structured
/// context behind a violation travels separately through the diagnostics
/// sink as a [`Complaint`](crate::report::Complaint).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("lock order violation: acquiring {acquiring} while holding {held}")]
    WrongOrder { acquiring: String, held: String },

    #[error("release order violation: {releasing} released before {blocking}")]
    WrongReleaseOrder { releasing: String, blocking: String },

    #[error("deadlock cycle of {threads} thread(s)")]
    Deadlock { threads: usize },

    #[error("an unrelated deadlock already exists")]
    ExistingDeadlock,

    #[error("thread would deadlock against a lock it already holds")]
    IllegalUpgrade,

    #[error("recursive acquisition forbidden for class {class}")]
    NestedNotAllowed { class: String },

    #[error("thread does not own the lock it is releasing")]
    NotOwner,

    #[error("thread is not among the signaller's waiters")]
    NotSignaller,

    #[error("allocation failed inside the validator")]
    OutOfMemory,

    #[error("validator invariant violated: {0}")]
    InternalError(&'static str),
}

impl Violation {
    /// Violations that soft-order mode downgrades to warnings.
    pub(crate) fn is_order_kind(&self) -> bool {
        matches!(
            self,
            Violation::WrongOrder { .. } | Violation::WrongReleaseOrder { .. }
        )
    }
}
