use std::collections::HashMap;
use std::panic::Location;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::*};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::arena::{Arena, Handle};
use crate::error::Violation;
use crate::hash::cache_slot;

/// Ordering domain assigned to one or more lock instances.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClassId(pub(crate) Handle);

impl ClassId {
    pub(crate) fn pack(self) -> u64 {
        self.0.pack()
    }
}

/// Secondary tag refining a class for finer-grained nesting rules.
///
/// Two locks of the same class may nest only in ascending subclass order:
/// `Any` outranks everything ("always wins"), `None` outranks nothing
/// ("always loses"), specific tags compare numerically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Subclass {
    None,
    Specific(u32),
    Any,
}

impl Subclass {
    /// May a lock tagged `self` be acquired while one tagged `held` of the
    /// same class is already held?
    pub(crate) fn outranks(self, held: Subclass) -> bool {
        self == Subclass::Any || self > held
    }
}

/// Per-class validation policy.
#[derive(Clone, Copy, Debug)]
pub struct ClassPolicy {
    /// Learn new prior-class rules from observed acquisition sequences.
    pub autolearn: bool,
    /// Allow a thread to re-enter locks of this class it already holds.
    pub recursion_ok: bool,
    /// Require strictly LIFO release of this class's locks.
    pub strict_release: bool,
    /// Skip order checking when the caller expects to wait less than this.
    pub min_order_check_wait: Duration,
    /// Skip deadlock detection when the caller expects to wait less than this.
    pub min_block_check_wait: Duration,
}

impl Default for ClassPolicy {
    fn default() -> Self {
        ClassPolicy {
            autolearn: true,
            recursion_ok: false,
            strict_release: false,
            min_order_check_wait: Duration::ZERO,
            min_block_check_wait: Duration::ZERO,
        }
    }
}

/// One entry in a class's prior chain: `class` is known safe to hold
/// before the owning class.
pub(crate) struct PriorRule {
    pub class: ClassId,
    pub taught_auto: bool,
    pub hits: AtomicU64,
}

/// Introspection row for one prior rule.
#[derive(Clone, Debug)]
pub struct PriorRuleInfo {
    pub class_name: String,
    /// Learned from an observed acquisition rather than declared.
    pub taught_auto: bool,
    /// Times the rule satisfied a membership test through the chain.
    pub hits: u64,
}

const CACHE_SLOTS: usize = 16;

pub(crate) struct ClassNode {
    pub name: String,
    pub site: &'static Location<'static>,
    pub policy: ClassPolicy,
    refs: AtomicU32,
    /// Registered under a call-site lookup key; such classes outlive a
    /// zero refcount.
    site_keyed: bool,
    /// Ground truth for the prior relation. Append-only while the class
    /// lives; mutation happens only under the registry's teaching section.
    prior: RwLock<Vec<PriorRule>>,
    /// Packed ClassIds of recently confirmed priors. A miss falls back to
    /// the chain; a zero slot is empty (generations start at one).
    cache: [AtomicU64; CACHE_SLOTS],
}

impl ClassNode {
    fn new(policy: ClassPolicy, name: String, site: &'static Location<'static>, site_keyed: bool) -> Self {
        ClassNode {
            name,
            site,
            policy,
            refs: AtomicU32::new(1),
            site_keyed,
            prior: RwLock::new(Vec::new()),
            cache: Default::default(),
        }
    }
}

type SiteKey = (&'static str, u32, u32);

fn site_key(site: &'static Location<'static>) -> SiteKey {
    (site.file(), site.line(), site.column())
}

/// Owns every lock class and the partial order between them.
pub(crate) struct ClassRegistry {
    arena: Arena<ClassNode>,
    by_site: Mutex<HashMap<SiteKey, ClassId>>,
    /// The teaching section: all prior-rule mutation serializes here, so
    /// concurrent auto-learning never races itself.
    teach: Mutex<()>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        ClassRegistry {
            arena: Arena::new(),
            by_site: Mutex::new(HashMap::new()),
            teach: Mutex::new(()),
        }
    }

    pub fn create(
        &self,
        policy: ClassPolicy,
        name: impl Into<String>,
        site: &'static Location<'static>,
    ) -> ClassId {
        ClassId(self.arena.insert(ClassNode::new(policy, name.into(), site, false)))
    }

    /// One class per distinct call site. Implicit classes pick up the
    /// supplied default thresholds and learn their own ordering rules.
    pub fn for_site(
        &self,
        site: &'static Location<'static>,
        min_order_check_wait: Duration,
        min_block_check_wait: Duration,
    ) -> ClassId {
        let mut map = self.by_site.lock();
        if let Some(&id) = map.get(&site_key(site)) {
            return id;
        }
        let policy = ClassPolicy {
            min_order_check_wait,
            min_block_check_wait,
            ..ClassPolicy::default()
        };
        let name = format!("{}:{}", site.file(), site.line());
        let id = ClassId(self.arena.insert(ClassNode::new(policy, name, site, true)));
        map.insert(site_key(site), id);
        id
    }

    pub fn get(&self, id: ClassId) -> Option<Arc<ClassNode>> {
        self.arena.get(id.0)
    }

    pub fn name_of(&self, id: ClassId) -> String {
        match self.get(id) {
            Some(node) => node.name.clone(),
            None => format!("<retired class {}.{}>", id.0.idx, id.0.gen),
        }
    }

    pub fn retain(&self, id: ClassId) {
        if let Some(node) = self.get(id) {
            node.refs.fetch_add(1, Relaxed);
        }
    }

    /// Drop one reference. A class with no references and no call-site
    /// registration is destroyed, releasing the references its prior
    /// chain held on other classes.
    pub fn release(&self, id: ClassId) {
        let mut worklist: SmallVec<[ClassId; 4]> = SmallVec::new();
        worklist.push(id);
        while let Some(id) = worklist.pop() {
            let Some(node) = self.get(id) else { continue };
            if node.refs.fetch_sub(1, AcqRel) != 1 || node.site_keyed {
                continue;
            }
            if let Some(node) = self.arena.remove(id.0) {
                for rule in node.prior.read().iter() {
                    worklist.push(rule.class);
                }
            }
        }
    }

    /// Direct prior-chain membership: is `other` known safe to hold before
    /// `class`? O(1) amortized through the per-class cache.
    pub fn is_prior(&self, class: ClassId, other: ClassId) -> bool {
        let Some(node) = self.get(class) else { return false };
        let bits = other.pack();
        let slot = cache_slot(&bits, CACHE_SLOTS);
        if node.cache[slot].load(Relaxed) == bits {
            return true;
        }
        let chain = node.prior.read();
        match chain.iter().find(|r| r.class == other) {
            Some(rule) => {
                rule.hits.fetch_add(1, Relaxed);
                node.cache[slot].store(bits, Relaxed);
                true
            }
            None => false,
        }
    }

    /// Transitive closure membership, walked with an explicit stack.
    pub fn is_prior_transitive(&self, class: ClassId, other: ClassId) -> bool {
        let mut seen: SmallVec<[ClassId; 16]> = SmallVec::new();
        let mut pending: SmallVec<[ClassId; 16]> = SmallVec::new();
        pending.push(class);
        while let Some(cur) = pending.pop() {
            if seen.contains(&cur) {
                continue;
            }
            seen.push(cur);
            let Some(node) = self.get(cur) else { continue };
            for rule in node.prior.read().iter() {
                if rule.class == other {
                    return true;
                }
                pending.push(rule.class);
            }
        }
        false
    }

    /// Declare that `prior` is safe to hold before `class`. Idempotent;
    /// refuses edges that would close a cycle in the class graph.
    pub fn add_prior_rule(
        &self,
        class: ClassId,
        prior: ClassId,
        taught_auto: bool,
    ) -> Result<(), Violation> {
        let _teaching = self.teach.lock();
        self.insert_rule_locked(class, prior, taught_auto)
    }

    /// Teach several rules atomically. Every rule is re-validated under
    /// the teaching section, so a conflicting rule registered by another
    /// thread since the caller's scan is caught here.
    pub fn teach_batch(&self, class: ClassId, priors: &[ClassId]) -> Result<(), Violation> {
        let _teaching = self.teach.lock();
        for &prior in priors {
            self.check_rule_locked(class, prior)?;
        }
        for &prior in priors {
            self.insert_rule_locked(class, prior, true)?;
        }
        Ok(())
    }

    fn check_rule_locked(&self, class: ClassId, prior: ClassId) -> Result<(), Violation> {
        if class == prior {
            return Err(Violation::WrongOrder {
                acquiring: self.name_of(class),
                held: self.name_of(prior),
            });
        }
        // A cycle exists iff `prior` already (transitively) depends on
        // `class`, i.e. `class` may be held before `prior`.
        if self.is_prior_transitive(prior, class) {
            return Err(Violation::WrongOrder {
                acquiring: self.name_of(class),
                held: self.name_of(prior),
            });
        }
        Ok(())
    }

    fn insert_rule_locked(
        &self,
        class: ClassId,
        prior: ClassId,
        taught_auto: bool,
    ) -> Result<(), Violation> {
        self.check_rule_locked(class, prior)?;
        let Some(node) = self.get(class) else {
            return Err(Violation::InternalError("teaching a retired class"));
        };
        let mut chain = node.prior.write();
        if chain.iter().any(|r| r.class == prior) {
            return Ok(());
        }
        chain.try_reserve(1).map_err(|_| Violation::OutOfMemory)?;
        self.retain(prior);
        chain.push(PriorRule {
            class: prior,
            taught_auto,
            hits: AtomicU64::new(0),
        });
        Ok(())
    }

    /// Number of rules in a class's chain. Inspection helper.
    pub fn rule_count(&self, class: ClassId) -> usize {
        self.get(class).map_or(0, |n| n.prior.read().len())
    }

    /// Dump of a class's prior chain, for diagnostics and introspection.
    pub fn rules_of(&self, class: ClassId) -> Vec<PriorRuleInfo> {
        let Some(node) = self.get(class) else { return Vec::new() };
        let result = node
            .prior
            .read()
            .iter()
            .map(|rule| PriorRuleInfo {
                class_name: self.name_of(rule.class),
                taught_auto: rule.taught_auto,
                hits: rule.hits.load(Relaxed),
            })
            .collect();
        result
    }
}
