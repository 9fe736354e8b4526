//! Integration Tests for the Reactive System
//!
//! These tests verify that observed state, watchers, lazy values and the
//! scheduler work together correctly.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use trellis_core::diagnostics;
use trellis_core::reactive::{
    delete_field, set_field, untracked, Expression, Owner, Record, Runtime, Sequence, Value,
    Watcher, WatcherOptions,
};
use trellis_core::{Config, EvalError, ReactiveError};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup(pairs: &[(&str, Value)]) -> (Runtime, Owner) {
    setup_with(Runtime::new(), pairs)
}

fn setup_with(runtime: Runtime, pairs: &[(&str, Value)]) -> (Runtime, Owner) {
    let state: Record = pairs.iter().cloned().collect();
    let owner = Owner::new(&runtime, "App", state);
    (runtime, owner)
}

/// Effect that counts its evaluations.
fn counting_effect<F>(owner: &Owner, runs: &Rc<Cell<usize>>, read: F) -> Watcher
where
    F: Fn(&Owner) -> Value + 'static,
{
    let runs = runs.clone();
    Watcher::effect(
        owner,
        Expression::new(move |owner| {
            runs.set(runs.get() + 1);
            Ok(read(owner))
        }),
        WatcherOptions::new(),
    )
    .unwrap()
}

/// Watcher that records every `(new, old)` pair it is called with.
fn recording_watcher(
    owner: &Owner,
    expression: &str,
    options: WatcherOptions,
) -> (Watcher, Rc<RefCell<Vec<(Value, Value)>>>) {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let sink = calls.clone();
    let watcher = Watcher::new(
        owner,
        expression,
        move |new, old| {
            sink.borrow_mut().push((new.clone(), old.clone()));
            Ok(())
        },
        options,
    )
    .unwrap();
    (watcher, calls)
}

fn nested(pairs: &[(&str, Value)]) -> Value {
    let record: Record = pairs.iter().cloned().collect();
    Value::from(record)
}

/// Test that a computation re-runs only for the fields it actually read.
#[test]
fn dependency_precision() {
    let (runtime, owner) = setup(&[
        ("a", 1.into()),
        ("b", 2.into()),
        ("user", nested(&[("name", "ada".into()), ("age", 36.into())])),
    ]);
    let runs = Rc::new(Cell::new(0));
    let _watcher = counting_effect(&owner, &runs, |owner| {
        owner.state().get("a");
        owner
            .state()
            .get("user")
            .as_record()
            .map(|user| user.get("name"))
            .unwrap_or_default()
    });
    assert_eq!(runs.get(), 1);

    owner.state().set("b", 3).unwrap();
    let user = owner.state().peek("user");
    user.as_record().unwrap().set("age", 37).unwrap();
    runtime.tick().unwrap();
    assert_eq!(runs.get(), 1);

    user.as_record().unwrap().set("name", "grace").unwrap();
    runtime.tick().unwrap();
    assert_eq!(runs.get(), 2);

    owner.state().set("a", 10).unwrap();
    runtime.tick().unwrap();
    assert_eq!(runs.get(), 3);
}

/// Test that dependencies are re-derived on every evaluation.
#[test]
fn dependency_rederivation() {
    let (runtime, owner) = setup(&[("flag", true.into()), ("a", 1.into()), ("b", 2.into())]);
    let runs = Rc::new(Cell::new(0));
    let watcher = counting_effect(&owner, &runs, |owner| {
        let state = owner.state();
        if state.get("flag").as_bool() == Some(true) {
            state.get("a")
        } else {
            state.get("b")
        }
    });
    assert_eq!(watcher.dependency_count(), 2);

    owner.state().set("flag", false).unwrap();
    runtime.tick().unwrap();
    assert_eq!(runs.get(), 2);
    assert_eq!(watcher.dependency_count(), 2);

    // `a` is no longer read.
    owner.state().set("a", 100).unwrap();
    assert!(!runtime.is_flush_pending());
    runtime.tick().unwrap();
    assert_eq!(runs.get(), 2);

    owner.state().set("b", 5).unwrap();
    runtime.tick().unwrap();
    assert_eq!(runs.get(), 3);
    assert_eq!(watcher.value(), Value::from(5));
}

/// Test that several writes before a flush produce a single run.
#[test]
fn writes_are_batched() {
    let (runtime, owner) = setup(&[("a", 1.into()), ("b", 1.into())]);
    let (_watcher, calls) = recording_watcher(&owner, "a", WatcherOptions::new());

    owner.state().set("a", 2).unwrap();
    owner.state().set("a", 3).unwrap();
    owner.state().set("a", 4).unwrap();
    assert_eq!(runtime.queued(), 1);
    assert!(calls.borrow().is_empty());

    runtime.tick().unwrap();
    assert_eq!(*calls.borrow(), vec![(Value::from(4), Value::from(1))]);
}

/// Test that writing an identical value notifies nobody, and that a
/// primitive that ends up unchanged does not fire the callback.
#[test]
fn no_op_writes_are_suppressed() {
    let shared: Record = Record::new();
    let (runtime, owner) = setup(&[
        ("a", 1.into()),
        ("nan", f64::NAN.into()),
        ("obj", Value::from(shared.clone())),
    ]);
    let (_watcher, calls) = recording_watcher(&owner, "a", WatcherOptions::new());
    let runs = Rc::new(Cell::new(0));
    let _others = counting_effect(&owner, &runs, |owner| {
        owner.state().get("nan");
        owner.state().get("obj")
    });

    owner.state().set("a", 1).unwrap();
    owner.state().set("nan", f64::NAN).unwrap();
    owner.state().set("obj", shared).unwrap();
    assert!(!runtime.is_flush_pending());

    // Changed and changed back before the flush: the watcher runs but its
    // value is the same primitive.
    owner.state().set("a", 2).unwrap();
    owner.state().set("a", 1).unwrap();
    runtime.tick().unwrap();
    assert!(calls.borrow().is_empty());
    assert_eq!(runs.get(), 1);
}

/// Test that the flush runs watchers in creation order, whatever order
/// they were queued in.
#[test]
fn parents_run_before_children() {
    let (runtime, owner) = setup(&[("parent", 0.into()), ("child", 0.into())]);
    let log = Rc::new(RefCell::new(Vec::new()));

    let parent_log = log.clone();
    let _parent = Watcher::new(
        &owner,
        "parent",
        move |_, _| {
            parent_log.borrow_mut().push("parent");
            Ok(())
        },
        WatcherOptions::new(),
    )
    .unwrap();
    let child_log = log.clone();
    let _child = Watcher::new(
        &owner,
        "child",
        move |_, _| {
            child_log.borrow_mut().push("child");
            Ok(())
        },
        WatcherOptions::new(),
    )
    .unwrap();

    owner.state().set("child", 1).unwrap();
    owner.state().set("parent", 1).unwrap();
    runtime.tick().unwrap();
    assert_eq!(*log.borrow(), vec!["parent", "child"]);
}

/// Test that a write made by a running watcher joins the current flush.
#[test]
fn writes_during_flush_join_the_flush() {
    let (runtime, owner) = setup(&[("source", 0.into()), ("derived", 0.into())]);
    let state = owner.state().clone();
    let _copier = Watcher::new(
        &owner,
        "source",
        move |new, _| {
            state
                .set("derived", new.clone())
                .map_err(|err| EvalError::new(err.to_string()))
        },
        WatcherOptions::new(),
    )
    .unwrap();
    let (_reader, calls) = recording_watcher(&owner, "derived", WatcherOptions::new());

    owner.state().set("source", 7).unwrap();
    assert_eq!(runtime.tick().unwrap(), 1);
    assert_eq!(*calls.borrow(), vec![(Value::from(7), Value::from(0))]);
}

/// Test that a deep watcher fires on nested writes and on added keys.
#[test]
fn deep_watch() {
    let (runtime, owner) = setup(&[(
        "user",
        nested(&[("address", nested(&[("city", "Oslo".into())]))]),
    )]);
    let (_deep, deep_calls) = recording_watcher(&owner, "user", WatcherOptions::new().deep());
    let (_shallow, shallow_calls) = recording_watcher(&owner, "user", WatcherOptions::new());

    let address = owner
        .state()
        .peek("user")
        .as_record()
        .unwrap()
        .peek("address");
    address.as_record().unwrap().set("city", "Bergen").unwrap();
    runtime.tick().unwrap();
    assert_eq!(deep_calls.borrow().len(), 1);
    assert!(shallow_calls.borrow().is_empty());

    // Same container on both sides.
    let (new, old) = deep_calls.borrow()[0].clone();
    assert_eq!(new, old);

    set_field(&address, "zip", "5003").unwrap();
    runtime.tick().unwrap();
    assert_eq!(deep_calls.borrow().len(), 2);
}

/// Test that intercepted sequence mutators notify, observe inserted
/// containers, and that element shape changes reach readers of the
/// sequence.
#[test]
fn sequence_mutation() {
    let item = nested(&[("label", "first".into())]);
    let items: Sequence = vec![item.clone()].into();
    let (runtime, owner) = setup(&[("items", Value::from(items.clone()))]);
    let (_watcher, calls) = recording_watcher(&owner, "items", WatcherOptions::new());

    let pushed = nested(&[("label", "second".into())]);
    items.push(pushed.clone()).unwrap();
    assert!(pushed.observer().is_some());
    runtime.tick().unwrap();
    assert_eq!(calls.borrow().len(), 1);

    items.reverse().unwrap();
    runtime.tick().unwrap();
    items.splice(0, 1, Vec::new()).unwrap();
    runtime.tick().unwrap();
    items.pop().unwrap();
    runtime.tick().unwrap();
    assert_eq!(calls.borrow().len(), 4);
    assert!(items.is_empty());

    items.unshift(item.clone()).unwrap();
    runtime.tick().unwrap();
    assert_eq!(calls.borrow().len(), 5);

    // Adding a key to an element notifies through the element's shape.
    set_field(&item, "done", true).unwrap();
    runtime.tick().unwrap();
    assert_eq!(calls.borrow().len(), 6);

    // Plain index writes are not intercepted; `set_field` is.
    items.set(0, 1);
    assert!(!runtime.is_flush_pending());
    set_field(&Value::from(items.clone()), 0usize, 2).unwrap();
    runtime.tick().unwrap();
    assert_eq!(calls.borrow().len(), 7);
    assert_eq!(items.get(0), Value::from(2));
}

/// Test that a length reader re-runs once per push, and that index reads
/// register no dependency at all.
#[test]
fn sequence_length_and_index_reads() {
    let items: Sequence = vec![Value::from(1), Value::from(2), Value::from(3)].into();
    let (runtime, owner) = setup(&[("items", Value::from(items.clone()))]);
    let (_length, calls) = recording_watcher(&owner, "items.length", WatcherOptions::new());

    items.push(4).unwrap();
    runtime.tick().unwrap();
    assert_eq!(*calls.borrow(), vec![(Value::from(4), Value::from(3))]);

    let index_runs = Rc::new(Cell::new(0));
    let held = items.clone();
    let first = counting_effect(&owner, &index_runs, move |_| held.get(0));
    assert_eq!(first.dependency_count(), 0);
    assert_eq!(first.value(), Value::from(1));

    items.push(5).unwrap();
    items.set(0, 10);
    items.reverse().unwrap();
    runtime.tick().unwrap();
    assert_eq!(index_runs.get(), 1);
    assert_eq!(calls.borrow().len(), 2);
}

/// Test that lazy values evaluate on read only, cache, and pass their
/// dependencies to whoever reads them.
#[test]
fn lazy_derived_values() {
    let (runtime, owner) = setup(&[("a", 1.into())]);
    let evaluations = Rc::new(Cell::new(0));
    let counter = evaluations.clone();
    let doubled = Watcher::computed(
        &owner,
        Expression::new(move |owner| {
            counter.set(counter.get() + 1);
            let a = owner.state().get("a").as_number().unwrap_or_default();
            Ok(Value::from(a * 2.0))
        }),
    );
    assert_eq!(evaluations.get(), 0);

    assert_eq!(doubled.read().unwrap(), Value::from(2));
    assert_eq!(doubled.read().unwrap(), Value::from(2));
    assert_eq!(evaluations.get(), 1);

    owner.state().set("a", 2).unwrap();
    assert!(doubled.is_dirty());
    assert_eq!(evaluations.get(), 1);
    assert!(!runtime.is_flush_pending());

    let reader = doubled.clone();
    let (_consumer, calls) = {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        let watcher = Watcher::new(
            &owner,
            Expression::new(move |_| reader.read().map_err(|err| EvalError::new(err.to_string()))),
            move |new, _| {
                sink.borrow_mut().push(new.clone());
                Ok(())
            },
            WatcherOptions::new(),
        )
        .unwrap();
        (watcher, calls)
    };
    assert_eq!(evaluations.get(), 2);

    owner.state().set("a", 5).unwrap();
    runtime.tick().unwrap();
    assert_eq!(*calls.borrow(), vec![Value::from(10)]);
    assert_eq!(evaluations.get(), 3);
}

/// Test that a watcher which keeps invalidating itself is stopped with a
/// diagnostic.
#[test]
fn runaway_updates_are_detected() {
    init_tracing();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    diagnostics::set_handler(Some(Rc::new(move |diagnostic: &ReactiveError| {
        sink.borrow_mut().push(diagnostic.clone());
    })));

    let runtime = Runtime::with_config(Config::default().with_max_update_count(10));
    let (runtime, owner) = setup_with(runtime, &[("count", 0.into())]);
    let state = owner.state().clone();
    let runs = Rc::new(Cell::new(0));
    let counter = runs.clone();
    let watcher = Watcher::new(
        &owner,
        "count",
        move |new, _| {
            counter.set(counter.get() + 1);
            let next = new.as_number().unwrap_or_default() + 1.0;
            state
                .set("count", next)
                .map_err(|err| EvalError::new(err.to_string()))
        },
        WatcherOptions::new().user(),
    )
    .unwrap();

    owner.state().set("count", 1).unwrap();
    runtime.tick().unwrap();

    assert_eq!(runs.get(), 11);
    assert!(!runtime.is_flush_pending());
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(matches!(
        &seen[0],
        ReactiveError::RunawayUpdate { watcher: id, count: 11, .. } if *id == watcher.id()
    ));
    diagnostics::set_handler(None);
}

/// Test that a silent runtime still aborts runaway loops and refuses
/// misuse without emitting diagnostics, even with a loud runtime on the
/// same thread.
#[test]
fn silent_runtime_still_aborts_runaway_loops() {
    let seen = Rc::new(Cell::new(0));
    let counter = seen.clone();
    diagnostics::set_handler(Some(Rc::new(move |_: &ReactiveError| {
        counter.set(counter.get() + 1);
    })));

    let config = Config::from_json(r#"{ "silent": true, "max_update_count": 3 }"#).unwrap();
    let (runtime, owner) = setup_with(Runtime::with_config(config), &[("n", 0.into())]);
    let (loud_runtime, loud_owner) = setup(&[("n", 0.into())]);
    let state = owner.state().clone();
    let _watcher = Watcher::new(
        &owner,
        "n",
        move |new, _| {
            let next = new.as_number().unwrap_or_default() + 1.0;
            state.set("n", next).map_err(|err| EvalError::new(err.to_string()))
        },
        WatcherOptions::new(),
    )
    .unwrap();

    owner.state().set("n", 1).unwrap();
    runtime.tick().unwrap();
    assert!(!runtime.is_flush_pending());

    let root = Value::from(owner.state().clone());
    set_field(&root, "extra", 1).unwrap();
    delete_field(&root, "n").unwrap();
    assert!(!owner.state().contains_key("extra"));
    assert!(owner.state().contains_key("n"));
    let bad_path = Watcher::effect(&owner, "n[0]", WatcherOptions::new()).unwrap();
    assert!(bad_path.value().is_undefined());
    {
        let _scope = runtime.enter();
        set_field(&Value::from(3), "x", 1).unwrap();
    }
    assert_eq!(seen.get(), 0);

    // The loud runtime next to it still reports.
    set_field(&Value::from(loud_owner.state().clone()), "extra", 1).unwrap();
    loud_runtime.tick().unwrap();
    assert_eq!(seen.get(), 1);
    diagnostics::set_handler(None);
}

/// Test that torn-down watchers never run again, even if already queued.
#[test]
fn teardown_is_permanent() {
    let (runtime, owner) = setup(&[("a", 1.into())]);
    let (watcher, calls) = recording_watcher(&owner, "a", WatcherOptions::new());

    owner.state().set("a", 2).unwrap();
    watcher.teardown();
    runtime.tick().unwrap();
    assert!(calls.borrow().is_empty());

    owner.state().set("a", 3).unwrap();
    assert!(!runtime.is_flush_pending());
    assert_eq!(watcher.dependency_count(), 0);
    assert!(!watcher.is_active());
}

/// Test that destroying the owner tears down all of its watchers.
#[test]
fn destroying_owner_stops_its_watchers() {
    let (runtime, owner) = setup(&[("a", 1.into())]);
    let (first, first_calls) = recording_watcher(&owner, "a", WatcherOptions::new());
    let (second, second_calls) = recording_watcher(&owner, "a", WatcherOptions::new().sync());

    owner.destroy();
    owner.state().set("a", 2).unwrap();
    runtime.tick().unwrap();
    assert!(first_calls.borrow().is_empty());
    assert!(second_calls.borrow().is_empty());
    assert!(!first.is_active() && !second.is_active());
}

/// Test that reads inside `untracked` do not become dependencies.
#[test]
fn untracked_reads_are_not_dependencies() {
    let (runtime, owner) = setup(&[("a", 1.into()), ("b", 1.into())]);
    let runs = Rc::new(Cell::new(0));
    let watcher = counting_effect(&owner, &runs, |owner| {
        let state = owner.state().clone();
        untracked(move || state.get("b"));
        owner.state().get("a")
    });
    assert_eq!(watcher.dependency_count(), 1);

    owner.state().set("b", 2).unwrap();
    runtime.tick().unwrap();
    assert_eq!(runs.get(), 1);
}

/// Test root-state protection and reactive key deletion.
#[test]
fn root_state_guard_and_delete() {
    init_tracing();
    let diagnostics_seen = Rc::new(Cell::new(0));
    let counter = diagnostics_seen.clone();
    diagnostics::set_handler(Some(Rc::new(move |_: &ReactiveError| {
        counter.set(counter.get() + 1);
    })));

    let (runtime, owner) = setup(&[("a", 1.into()), ("child", nested(&[("x", 1.into())]))]);
    let root = Value::from(owner.state().clone());

    set_field(&root, "extra", 1).unwrap();
    delete_field(&root, "a").unwrap();
    assert!(!owner.state().contains_key("extra"));
    assert!(owner.state().contains_key("a"));
    assert_eq!(diagnostics_seen.get(), 2);

    let child = owner.state().peek("child");
    let (_watcher, calls) = recording_watcher(&owner, "child", WatcherOptions::new());
    delete_field(&child, "x").unwrap();
    runtime.tick().unwrap();
    assert_eq!(calls.borrow().len(), 1);

    set_field(&Value::from(3), "x", 1).unwrap();
    assert_eq!(diagnostics_seen.get(), 3);
    diagnostics::set_handler(None);
}

/// Test that an invalid watch path warns and evaluates to `Undefined`.
#[test]
fn invalid_path_yields_undefined() {
    let warned = Rc::new(Cell::new(false));
    let flag = warned.clone();
    diagnostics::set_handler(Some(Rc::new(move |diagnostic: &ReactiveError| {
        flag.set(matches!(diagnostic, ReactiveError::InvalidPath(_)));
    })));

    let (_runtime, owner) = setup(&[("a", 1.into())]);
    let watcher = Watcher::effect(&owner, "a[0]", WatcherOptions::new()).unwrap();
    assert!(warned.get());
    assert!(watcher.value().is_undefined());
    assert_eq!(watcher.dependency_count(), 0);
    diagnostics::set_handler(None);
}
