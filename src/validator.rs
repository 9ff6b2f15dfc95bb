use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::*};
use std::sync::Arc;
use std::time::Duration;

use crate::arena::Arena;
use crate::class::{ClassId, ClassPolicy, ClassRegistry, PriorRuleInfo, Subclass};
use crate::config::Config;
use crate::detect::{self, CycleHop, Outcome};
use crate::error::Violation;
use crate::gate::{Phase, PhaseGate};
use crate::order;
use crate::record::{Acquired, RecordId, RecordNode};
use crate::report::{Complaint, FrameSnapshot, RecordSnapshot, Sink, TracingSink};
use crate::thread::{self, ThreadId, ThreadNode};

/// The validation context: class registry, record and thread tables, the
/// admission gate and the diagnostics sink. One per instrumented runtime;
/// independent contexts share nothing.
pub struct Validator {
    pub(crate) cfg: Config,
    pub(crate) classes: ClassRegistry,
    pub(crate) records: Arena<RecordNode>,
    pub(crate) threads: Arena<ThreadNode>,
    pub(crate) gate: PhaseGate,
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) depth_warned: AtomicBool,
    ctx: u64,
}

impl Validator {
    pub fn new(cfg: Config) -> Self {
        Validator::with_sink(cfg, Arc::new(TracingSink))
    }

    pub fn with_sink(cfg: Config, sink: Arc<dyn Sink>) -> Self {
        static NEXT_CTX: AtomicU64 = AtomicU64::new(1);
        Validator {
            cfg,
            classes: ClassRegistry::new(),
            records: Arena::new(),
            threads: Arena::new(),
            gate: PhaseGate::new(),
            sink,
            depth_warned: AtomicBool::new(false),
            ctx: NEXT_CTX.fetch_add(1, Relaxed),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    // ----- thread sessions -----------------------------------------

    pub fn register_thread(&self, name: impl Into<String>) -> ThreadId {
        let _g = self.gate.enter(Phase::Account);
        ThreadId(self.threads.insert(ThreadNode::new(name.into())))
    }

    /// The session of the calling OS thread, registered on first use.
    pub fn current_thread(&self) -> ThreadId {
        if let Some(id) = thread::cached_session(self.ctx) {
            return id;
        }
        let cur = std::thread::current();
        let name = match cur.name() {
            Some(name) => name.to_owned(),
            None => format!("{:?}", cur.id()),
        };
        let id = self.register_thread(name);
        thread::cache_session(self.ctx, id);
        id
    }

    /// Tear down a session. The teardown runs under the inspection side so
    /// no concurrent walk can observe a half-removed thread.
    pub fn thread_exited(&self, thread: ThreadId) {
        thread::evict_session(self.ctx, thread);
        let _g = self.gate.enter(Phase::Inspect);
        self.threads.remove(thread.0);
    }

    pub fn thread_name(&self, thread: ThreadId) -> String {
        self.threads
            .get(thread.0)
            .map_or_else(|| "<exited thread>".into(), |tn| tn.name.clone())
    }

    /// Number of stack frames (main plus recursion) the thread holds.
    pub fn held_count(&self, thread: ThreadId) -> usize {
        self.threads.get(thread.0).map_or(0, |tn| tn.held_count())
    }

    /// The record the thread is registered as waiting on, if any.
    pub fn waiting_on(&self, thread: ThreadId) -> Option<RecordId> {
        self.threads.get(thread.0)?.sleeping_on()
    }

    // ----- class registry ------------------------------------------

    #[track_caller]
    pub fn create_class(&self, policy: ClassPolicy, name: &str) -> ClassId {
        self.classes.create(policy, name, Location::caller())
    }

    /// The memoized class of the calling source position.
    #[track_caller]
    pub fn class_here(&self) -> ClassId {
        self.class_for_site(Location::caller())
    }

    pub fn class_for_site(&self, site: &'static Location<'static>) -> ClassId {
        self.classes
            .for_site(site, self.cfg.min_order_check_wait, self.cfg.min_block_check_wait)
    }

    /// Declare that `prior` may be held when acquiring `class`.
    pub fn add_prior_rule(&self, class: ClassId, prior: ClassId) -> Result<(), Violation> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let _g = self.gate.enter(Phase::Account);
        match self.classes.add_prior_rule(class, prior, false) {
            Ok(()) => Ok(()),
            Err(violation) => self.complain_unthreaded(violation),
        }
    }

    pub fn is_prior(&self, class: ClassId, other: ClassId) -> bool {
        self.classes.is_prior(class, other)
    }

    /// Number of prior-class rules a class carries.
    pub fn prior_rule_count(&self, class: ClassId) -> usize {
        self.classes.rule_count(class)
    }

    /// Dump of a class's prior chain.
    pub fn prior_rules(&self, class: ClassId) -> Vec<PriorRuleInfo> {
        self.classes.rules_of(class)
    }

    pub fn retain_class(&self, class: ClassId) {
        self.classes.retain(class);
    }

    pub fn release_class(&self, class: ClassId) {
        self.classes.release(class);
    }

    // ----- record lifecycle ----------------------------------------

    pub fn init_exclusive(&self, class: ClassId, subclass: Subclass) -> RecordId {
        let _g = self.gate.enter(Phase::Account);
        self.classes.retain(class);
        RecordId(self.records.insert(RecordNode::new_exclusive(class, subclass)))
    }

    pub fn init_shared(&self, class: ClassId, subclass: Subclass, signaller: bool) -> RecordId {
        let _g = self.gate.enter(Phase::Account);
        self.classes.retain(class);
        RecordId(self.records.insert(RecordNode::new_shared(class, subclass, signaller)))
    }

    /// Link the exclusive and shared facets of one physical lock so the
    /// detector follows ownership through either side.
    pub fn pair_records(&self, a: RecordId, b: RecordId) {
        let _g = self.gate.enter(Phase::Account);
        if let (Some(ra), Some(rb)) = (self.records.get(a.0), self.records.get(b.0)) {
            ra.set_sibling(b);
            rb.set_sibling(a);
        }
    }

    /// Destroy a record. Runs under the inspection side so a concurrent
    /// walk never sees it half-gone.
    pub fn delete_record(&self, record: RecordId) {
        let _g = self.gate.enter(Phase::Inspect);
        if let Some(rec) = self.records.remove(record.0) {
            self.classes.release(rec.class);
        }
    }

    // ----- acquire-side hooks --------------------------------------

    /// Static order check for an acquisition that is not expected to
    /// block (or not known to block yet).
    pub fn check_order(
        &self,
        thread: ThreadId,
        record: RecordId,
        expected_wait: Option<Duration>,
    ) -> Result<(), Violation> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let _g = self.gate.enter(Phase::Account);
        order::check_acquire(self, thread, record, expected_wait)
    }

    /// Full check before actually blocking: order first, then the thread
    /// is registered as waiting and the deadlock walk runs. On success the
    /// thread stays registered as waiting; `set_owner` (or
    /// `clear_waiting`) ends that state.
    pub fn check_blocking(
        &self,
        thread: ThreadId,
        record: RecordId,
        expected_wait: Option<Duration>,
    ) -> Result<(), Violation> {
        if !self.cfg.enabled {
            return Ok(());
        }
        {
            let _g = self.gate.enter(Phase::Account);
            order::check_acquire(self, thread, record, expected_wait)?;
            let Some(tn) = self.threads.get(thread.0) else {
                return Err(Violation::InternalError("blocking check for an unknown thread"));
            };
            tn.set_blocked(record);
        }

        if let Some(wait) = expected_wait {
            if let Some(rec) = self.records.get(record.0) {
                if let Some(class) = self.classes.get(rec.class) {
                    if class.policy.min_block_check_wait > wait {
                        return Ok(());
                    }
                }
            }
        }

        let outcome = {
            let _g = self.gate.enter(Phase::Inspect);
            detect::detect(self, thread, record)
        };
        match outcome {
            Outcome::Clear => Ok(()),
            Outcome::Deadlock(cycle) => {
                self.clear_waiting(thread);
                let related = self.cycle_records(&cycle);
                self.complain(
                    Violation::Deadlock { threads: cycle.len() },
                    thread,
                    Some(record),
                    &related,
                )
            }
            Outcome::IllegalUpgrade(cycle) => {
                self.clear_waiting(thread);
                let related = self.cycle_records(&cycle);
                self.complain(Violation::IllegalUpgrade, thread, Some(record), &related)
            }
            Outcome::Existing => {
                self.clear_waiting(thread);
                self.complain(Violation::ExistingDeadlock, thread, Some(record), &[])
            }
        }
    }

    /// Record the thread as owner after the real primitive was acquired.
    #[track_caller]
    pub fn set_owner(&self, thread: ThreadId, record: RecordId) -> Result<(), Violation> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let site = Location::caller();
        let _g = self.gate.enter(Phase::Account);
        let Some(tn) = self.threads.get(thread.0) else {
            return Err(Violation::InternalError("set_owner for an unknown thread"));
        };
        tn.clear_blocked();
        let Some(rec) = self.records.get(record.0) else {
            return Err(Violation::InternalError("set_owner on a retired record"));
        };
        match rec.note_owner(thread, site) {
            Ok(Acquired::First) => {
                tn.push_frame(record, false, site);
                Ok(())
            }
            Ok(Acquired::Recursed) => {
                tn.push_frame(record, true, site);
                Ok(())
            }
            // A full owner table loses this acquisition's bookkeeping
            // rather than failing the caller's acquire.
            Err(Violation::OutOfMemory) => {
                tracing::debug!(target: "lockvet", "owner table full; acquisition untracked");
                Ok(())
            }
            Err(violation) => self.complain(violation, thread, Some(record), &[]),
        }
    }

    /// Stop being registered as waiting without acquiring (timeout or
    /// cancelled acquisition on the real primitive).
    pub fn clear_waiting(&self, thread: ThreadId) {
        let _g = self.gate.enter(Phase::Account);
        if let Some(tn) = self.threads.get(thread.0) {
            tn.clear_blocked();
        }
    }

    // ----- release-side hooks --------------------------------------

    pub fn check_release_order(&self, thread: ThreadId, record: RecordId) -> Result<(), Violation> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let _g = self.gate.enter(Phase::Account);
        order::check_release(self, thread, record)
    }

    pub fn release_owner(&self, thread: ThreadId, record: RecordId) -> Result<(), Violation> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let _g = self.gate.enter(Phase::Account);
        let Some(rec) = self.records.get(record.0) else {
            return Err(Violation::InternalError("release of a retired record"));
        };
        let Some(tn) = self.threads.get(thread.0) else {
            return Err(Violation::InternalError("release for an unknown thread"));
        };
        match rec.note_release(thread) {
            Ok(released) => match tn.drop_frame(record, released) {
                Ok(()) => Ok(()),
                Err(violation) => self.complain(violation, thread, Some(record), &[]),
            },
            Err(violation) => self.complain(violation, thread, Some(record), &[]),
        }
    }

    // ----- complaints ----------------------------------------------

    /// Deliver a complaint and decide its fate: soft-order mode downgrades
    /// ordering violations to reported warnings, everything else errors.
    pub(crate) fn complain(
        &self,
        violation: Violation,
        thread: ThreadId,
        offending: Option<RecordId>,
        related: &[RecordId],
    ) -> Result<(), Violation> {
        if !self.cfg.quiet {
            let complaint = Complaint {
                violation: violation.clone(),
                thread: self.thread_name(thread),
                offending: offending.and_then(|r| self.snapshot_record(r)),
                related: related.iter().filter_map(|&r| self.snapshot_record(r)).collect(),
                stack: self.snapshot_frames(thread),
            };
            self.sink.report(&complaint);
        }
        if self.cfg.soft_order && violation.is_order_kind() {
            Ok(())
        } else {
            Err(violation)
        }
    }

    fn complain_unthreaded(&self, violation: Violation) -> Result<(), Violation> {
        if !self.cfg.quiet {
            let complaint = Complaint {
                violation: violation.clone(),
                thread: "<none>".into(),
                offending: None,
                related: Vec::new(),
                stack: Vec::new(),
            };
            self.sink.report(&complaint);
        }
        if self.cfg.soft_order && violation.is_order_kind() {
            Ok(())
        } else {
            Err(violation)
        }
    }

    fn cycle_records(&self, cycle: &[CycleHop]) -> Vec<RecordId> {
        cycle.iter().map(|hop| hop.record).collect()
    }

    pub(crate) fn snapshot_record(&self, record: RecordId) -> Option<RecordSnapshot> {
        let rec = self.records.get(record.0)?;
        Some(RecordSnapshot {
            record,
            class_name: self.classes.name_of(rec.class),
            class_site: self.classes.get(rec.class).map(|c| c.site),
            subclass: rec.subclass,
            owner: rec.exclusive_owner().map(|t| self.thread_name(t)),
            site: rec.acquire_site(),
        })
    }

    fn snapshot_frames(&self, thread: ThreadId) -> Vec<FrameSnapshot> {
        let Some(tn) = self.threads.get(thread.0) else { return Vec::new() };
        tn.snapshot_stack()
            .into_iter()
            .map(|frame| FrameSnapshot {
                class_name: self
                    .records
                    .get(frame.record.0)
                    .map_or_else(|| "<retired record>".into(), |r| self.classes.name_of(r.class)),
                subclass: self
                    .records
                    .get(frame.record.0)
                    .map_or(Subclass::None, |r| r.subclass),
                recursion: frame.recursion,
                site: frame.site,
            })
            .collect()
    }
}
