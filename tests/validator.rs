//! End-to-end scenarios driven through the public hook API, with thread
//! sessions simulated so every interleaving is deterministic.

use std::sync::Arc;
use std::time::Duration;

use lockvet::{ClassPolicy, CollectSink, Config, Subclass, Validator, Violation};

fn context() -> (Validator, Arc<CollectSink>) {
    let sink = Arc::new(CollectSink::new());
    let v = Validator::with_sink(Config::default(), sink.clone());
    (v, sink)
}

#[test]
fn learned_order_is_enforced() {
    let (v, _sink) = context();
    let net = v.create_class(ClassPolicy::default(), "net");
    let disk = v.create_class(ClassPolicy::default(), "disk");
    let a = v.init_exclusive(net, Subclass::None);
    let b = v.init_exclusive(disk, Subclass::None);

    let t1 = v.register_thread("t1");
    v.check_order(t1, a, None).unwrap();
    v.set_owner(t1, a).unwrap();
    v.check_order(t1, b, None).unwrap();
    v.set_owner(t1, b).unwrap();
    assert!(v.is_prior(disk, net));
    v.release_owner(t1, b).unwrap();
    v.release_owner(t1, a).unwrap();

    // Any thread acquiring in the reverse direction is refused before it
    // can block.
    let t2 = v.register_thread("t2");
    v.check_order(t2, b, None).unwrap();
    v.set_owner(t2, b).unwrap();
    assert!(matches!(
        v.check_order(t2, a, None),
        Err(Violation::WrongOrder { .. })
    ));
    assert!(matches!(
        v.check_blocking(t2, a, None),
        Err(Violation::WrongOrder { .. })
    ));
    assert_eq!(v.waiting_on(t2), None);
}

#[test]
fn two_thread_cycle_is_a_deadlock() {
    let (v, _sink) = context();
    // One class with wildcard subclasses keeps the order checker neutral;
    // this scenario is the detector's.
    let class = v.create_class(ClassPolicy::default(), "ab");
    let a = v.init_exclusive(class, Subclass::Any);
    let b = v.init_exclusive(class, Subclass::Any);

    let t1 = v.register_thread("t1");
    let t2 = v.register_thread("t2");
    v.set_owner(t1, a).unwrap();
    v.set_owner(t2, b).unwrap();

    // t2 is still running, so t1 may wait for b.
    v.check_blocking(t1, b, None).unwrap();
    assert_eq!(v.waiting_on(t1), Some(b));

    // Both edges now exist; t2's attempt closes the cycle.
    assert_eq!(
        v.check_blocking(t2, a, None),
        Err(Violation::Deadlock { threads: 2 })
    );
    assert_eq!(v.waiting_on(t2), None);
}

#[test]
fn forbidden_recursion_is_nested_not_allowed() {
    let (v, _sink) = context();
    let class = v.create_class(
        ClassPolicy { recursion_ok: false, ..ClassPolicy::default() },
        "norec",
    );
    let l = v.init_exclusive(class, Subclass::None);
    let t = v.register_thread("t");
    v.set_owner(t, l).unwrap();
    assert!(matches!(
        v.check_order(t, l, None),
        Err(Violation::NestedNotAllowed { .. })
    ));
}

#[test]
fn self_cycle_is_illegal_upgrade() {
    let (v, _sink) = context();
    // Recursion is legal here, so the order checker waves the re-entry
    // through and the detector's cycle-of-one logic answers instead.
    let class = v.create_class(
        ClassPolicy { recursion_ok: true, ..ClassPolicy::default() },
        "rec",
    );
    let l = v.init_exclusive(class, Subclass::None);
    let t = v.register_thread("t");
    v.set_owner(t, l).unwrap();
    assert_eq!(v.check_blocking(t, l, None), Err(Violation::IllegalUpgrade));
    assert_eq!(v.waiting_on(t), None);
}

#[test]
fn recursion_round_trip_empties_the_stack() {
    let (v, sink) = context();
    let class = v.create_class(
        ClassPolicy { recursion_ok: true, ..ClassPolicy::default() },
        "rec",
    );
    let l = v.init_exclusive(class, Subclass::None);
    let t = v.register_thread("t");

    for depth in 1..=4usize {
        v.check_order(t, l, None).unwrap();
        v.set_owner(t, l).unwrap();
        assert_eq!(v.held_count(t), depth);
    }
    for depth in (0..4usize).rev() {
        v.check_release_order(t, l).unwrap();
        v.release_owner(t, l).unwrap();
        assert_eq!(v.held_count(t), depth);
    }
    assert!(sink.is_empty());
}

#[test]
fn strict_class_demands_lifo_release() {
    let (v, _sink) = context();
    let class = v.create_class(
        ClassPolicy { strict_release: true, ..ClassPolicy::default() },
        "strict",
    );
    let x = v.init_exclusive(class, Subclass::Specific(1));
    let y = v.init_exclusive(class, Subclass::Specific(2));
    let t = v.register_thread("t");

    v.check_order(t, x, None).unwrap();
    v.set_owner(t, x).unwrap();
    v.check_order(t, y, None).unwrap();
    v.set_owner(t, y).unwrap();

    assert!(matches!(
        v.check_release_order(t, x),
        Err(Violation::WrongReleaseOrder { .. })
    ));
    v.check_release_order(t, y).unwrap();
    v.release_owner(t, y).unwrap();
    v.check_release_order(t, x).unwrap();
    v.release_owner(t, x).unwrap();
    assert_eq!(v.held_count(t), 0);
}

#[test]
fn relaxed_class_releases_in_any_order() {
    let (v, sink) = context();
    let c1 = v.create_class(ClassPolicy::default(), "outer");
    let c2 = v.create_class(ClassPolicy::default(), "inner");
    let a = v.init_exclusive(c1, Subclass::None);
    let b = v.init_exclusive(c2, Subclass::None);
    let t = v.register_thread("t");

    v.set_owner(t, a).unwrap();
    v.set_owner(t, b).unwrap();
    // Splice the older lock out from under the newer one.
    v.check_release_order(t, a).unwrap();
    v.release_owner(t, a).unwrap();
    v.release_owner(t, b).unwrap();
    assert_eq!(v.held_count(t), 0);
    assert!(sink.is_empty());
}

#[test]
fn running_shared_holders_are_not_deadlock_participants() {
    let (v, sink) = context();
    let class = v.create_class(ClassPolicy::default(), "rw");
    let shared = v.init_shared(class, Subclass::None, false);
    let excl = v.init_exclusive(class, Subclass::None);
    v.pair_records(excl, shared);

    for name in ["r1", "r2", "r3"] {
        let r = v.register_thread(name);
        v.check_order(r, shared, None).unwrap();
        v.set_owner(r, shared).unwrap();
    }

    // A writer may wait: all three holders are running, none sleeps.
    let w = v.register_thread("writer");
    v.check_blocking(w, excl, None).unwrap();
    assert_eq!(v.waiting_on(w), Some(excl));
    v.clear_waiting(w);
    assert_eq!(v.waiting_on(w), None);
    assert!(sink.is_empty());
}

#[test]
fn signaller_needs_every_waiter_asleep() {
    let (v, _sink) = context();
    let class = v.create_class(ClassPolicy::default(), "cv");
    let signal = v.init_shared(class, Subclass::Any, true);
    let held = v.init_exclusive(class, Subclass::Any);

    let t1 = v.register_thread("t1");
    let t2 = v.register_thread("t2");
    let t3 = v.register_thread("t3");

    v.set_owner(t1, signal).unwrap();
    v.set_owner(t3, signal).unwrap();
    v.set_owner(t2, held).unwrap();

    // t1 sleeps on the record t2 owns; t3 is still awake, so the signal
    // wait contributes no edges yet.
    v.check_blocking(t1, held, None).unwrap();
    v.check_blocking(t2, signal, None).unwrap();
    assert_eq!(v.waiting_on(t2), Some(signal));

    // Once t3 also goes to sleep on the signal's chain, the cycle through
    // the waiter table closes.
    assert_eq!(
        v.check_blocking(t3, held, None),
        Err(Violation::Deadlock { threads: 2 })
    );
}

#[test]
fn declared_rules_are_idempotent_and_acyclic() {
    let (v, _sink) = context();
    let a = v.create_class(ClassPolicy::default(), "a");
    let b = v.create_class(ClassPolicy::default(), "b");
    v.add_prior_rule(b, a).unwrap();
    v.add_prior_rule(b, a).unwrap();
    assert_eq!(v.prior_rule_count(b), 1);
    assert!(matches!(
        v.add_prior_rule(a, b),
        Err(Violation::WrongOrder { .. })
    ));

    let rules = v.prior_rules(b);
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].class_name, "a");
    assert!(!rules[0].taught_auto);
    assert_eq!(rules[0].hits, 0);
    // Chain lookups count; cache hits do not.
    assert!(v.is_prior(b, a));
    assert!(v.is_prior(b, a));
    assert_eq!(v.prior_rules(b)[0].hits, 1);
}

#[test]
fn concurrent_autolearning_teaches_one_rule() {
    let (v, sink) = context();
    let v = Arc::new(v);
    let base = v.create_class(ClassPolicy::default(), "base");
    let upper = v.create_class(ClassPolicy::default(), "upper");

    let mut handles = Vec::new();
    for i in 0..4 {
        let v = Arc::clone(&v);
        handles.push(std::thread::spawn(move || {
            let t = v.register_thread(format!("t{i}"));
            let held = v.init_exclusive(base, Subclass::Specific(i));
            let new = v.init_exclusive(upper, Subclass::Specific(i));
            for _ in 0..50 {
                v.check_order(t, held, None).unwrap();
                v.set_owner(t, held).unwrap();
                v.check_order(t, new, None).unwrap();
                v.set_owner(t, new).unwrap();
                v.release_owner(t, new).unwrap();
                v.release_owner(t, held).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(v.prior_rule_count(upper), 1);
    assert!(v.is_prior(upper, base));
    assert!(v.prior_rules(upper)[0].taught_auto);
    assert!(sink.is_empty());
}

#[test]
fn unrelated_cycle_reports_existing_deadlock() {
    let (v, _sink) = context();
    // A class lazy enough that building the tangle skips the walk.
    let web = v.create_class(
        ClassPolicy {
            min_block_check_wait: Duration::from_secs(1),
            ..ClassPolicy::default()
        },
        "web",
    );
    let fast = Some(Duration::ZERO);

    // A two-thread cycle that does not involve the origin.
    let hub = v.init_shared(web, Subclass::Any, false);
    let ra = v.init_exclusive(web, Subclass::Any);
    let rc = v.init_exclusive(web, Subclass::Any);
    let ta = v.register_thread("ta");
    let tb = v.register_thread("tb");
    let tc = v.register_thread("tc");
    v.set_owner(ta, hub).unwrap();
    v.set_owner(tb, hub).unwrap();
    v.set_owner(ta, rc).unwrap();
    v.set_owner(tc, ra).unwrap();
    v.check_blocking(ta, ra, fast).unwrap();
    v.check_blocking(tc, rc, fast).unwrap();

    // A chain long enough to exhaust the walk stack behind the second
    // branch of the hub.
    let mut chain = Vec::new();
    for i in 0..=70 {
        chain.push(v.init_exclusive(web, Subclass::Any));
        if i > 0 {
            let u = v.register_thread(format!("u{i}"));
            v.set_owner(u, chain[i - 1]).unwrap();
            v.check_blocking(u, chain[i], fast).unwrap();
        }
    }
    v.check_blocking(tb, chain[0], fast).unwrap();

    let origin = v.register_thread("origin");
    assert_eq!(
        v.check_blocking(origin, hub, None),
        Err(Violation::ExistingDeadlock)
    );
}

#[test]
fn soft_order_reports_but_passes() {
    let sink = Arc::new(CollectSink::new());
    let v = Validator::with_sink(Config::default().soft_order(), sink.clone());
    let net = v.create_class(ClassPolicy::default(), "net");
    let disk = v.create_class(ClassPolicy::default(), "disk");
    v.add_prior_rule(disk, net).unwrap();

    let a = v.init_exclusive(net, Subclass::None);
    let b = v.init_exclusive(disk, Subclass::None);
    let t = v.register_thread("t");
    v.set_owner(t, b).unwrap();
    // The violation is reported, then waved through.
    v.check_order(t, a, None).unwrap();
    let complaints = sink.take();
    assert_eq!(complaints.len(), 1);
    assert!(matches!(complaints[0].violation, Violation::WrongOrder { .. }));
}

#[test]
fn short_waits_skip_the_order_check() {
    let (v, sink) = context();
    let hot = v.create_class(
        ClassPolicy {
            min_order_check_wait: Duration::from_millis(1),
            ..ClassPolicy::default()
        },
        "hot",
    );
    let cold = v.create_class(ClassPolicy::default(), "cold");
    v.add_prior_rule(cold, hot).unwrap();

    let a = v.init_exclusive(hot, Subclass::None);
    let b = v.init_exclusive(cold, Subclass::None);
    let t = v.register_thread("t");
    v.set_owner(t, b).unwrap();

    // Below the class threshold the check is skipped outright.
    v.check_order(t, a, Some(Duration::ZERO)).unwrap();
    assert!(sink.is_empty());
    // With no wait hint it runs and flags the inversion.
    assert!(matches!(
        v.check_order(t, a, None),
        Err(Violation::WrongOrder { .. })
    ));
}

#[test]
fn disabled_context_is_inert() {
    let (vcfg, sink) = {
        let sink = Arc::new(CollectSink::new());
        (Validator::with_sink(Config::disabled(), sink.clone()), sink)
    };
    let class = vcfg.create_class(ClassPolicy::default(), "off");
    let a = vcfg.init_exclusive(class, Subclass::None);
    let t = vcfg.register_thread("t");
    vcfg.check_order(t, a, None).unwrap();
    vcfg.check_blocking(t, a, None).unwrap();
    vcfg.set_owner(t, a).unwrap();
    vcfg.release_owner(t, a).unwrap();
    assert_eq!(vcfg.held_count(t), 0);
    assert!(sink.is_empty());
}

#[test]
fn releasing_without_owning_is_refused() {
    let (v, sink) = context();
    let class = v.create_class(ClassPolicy::default(), "c");
    let a = v.init_exclusive(class, Subclass::None);
    let t = v.register_thread("t");
    assert_eq!(v.release_owner(t, a), Err(Violation::NotOwner));
    assert_eq!(sink.len(), 1);
}

#[test]
fn deleted_records_resolve_to_internal_error() {
    let (v, _sink) = context();
    let class = v.create_class(ClassPolicy::default(), "c");
    let a = v.init_exclusive(class, Subclass::None);
    let t = v.register_thread("t");
    v.delete_record(a);
    assert!(matches!(
        v.check_order(t, a, None),
        Err(Violation::InternalError(_))
    ));
}
