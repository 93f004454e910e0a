//! Truncate behavior of collections and subscriptions.
//!
//! These tests drive a collection through its sync handle while optimistic
//! mutations are pending, and check what subscribers observe.

use rill_core::{Completion, Error, Key, Result, Value};
use rill_query::{LoadSubsetOptions, LoadSubsetResult};
use rill_reactive::{
    ChangeKind, ChangeSet, Collection, CollectionConfig, SubscribeOptions, SyncHandle, SyncOperation, SyncSource,
};
use std::cell::RefCell;
use std::rc::Rc;

fn row(id: i64, value: &str) -> Value {
    Value::object([("id", Value::Int64(id)), ("value", Value::from(value))])
}

fn with_value(v: &Value, value: &str) -> Value {
    let mut v = v.clone();
    v.set_field("value", Value::from(value));
    v
}

fn key_of(v: &Value) -> Key {
    v.get_field("id").and_then(Key::from_value).unwrap_or(Key::Int(-1))
}

/// A source handing out its sync handle and answering subset loads with
/// completions the test resolves.
#[derive(Clone, Default)]
struct TestSource {
    handle: Rc<RefCell<Option<SyncHandle>>>,
    loads: Rc<RefCell<Vec<(LoadSubsetOptions, Completion)>>>,
    synchronous_loads: Rc<RefCell<bool>>,
}

impl SyncSource for TestSource {
    fn sync(&self, handle: SyncHandle) -> Result<()> {
        *self.handle.borrow_mut() = Some(handle);
        Ok(())
    }

    fn load_subset(&self, options: &LoadSubsetOptions) -> LoadSubsetResult {
        if *self.synchronous_loads.borrow() {
            self.loads.borrow_mut().push((options.clone(), Completion::resolved()));
            return LoadSubsetResult::Loaded;
        }
        let completion = Completion::new();
        self.loads.borrow_mut().push((options.clone(), completion.clone()));
        LoadSubsetResult::Pending(completion)
    }
}

impl TestSource {
    fn handle(&self) -> SyncHandle {
        self.handle.borrow().clone().unwrap()
    }

    fn sync_rows(&self, truncate: bool, rows: &[Value]) {
        let handle = self.handle();
        handle.begin().unwrap();
        if truncate {
            handle.truncate().unwrap();
        }
        for row in rows {
            handle.write(SyncOperation::Insert(row.clone())).unwrap();
        }
        handle.commit().unwrap();
    }

    fn resolve_loads(&self) {
        let loads: Vec<Completion> = self.loads.borrow().iter().map(|(_, c)| c.clone()).collect();
        for completion in loads {
            completion.resolve();
        }
    }
}

/// Collection whose mutation handlers park their confirmations in `pending`.
fn todos(source: &TestSource, pending: &Rc<RefCell<Vec<Completion>>>) -> Collection {
    let parked = |pending: &Rc<RefCell<Vec<Completion>>>| {
        let pending = pending.clone();
        move |_: &rill_reactive::Transaction| {
            let c = Completion::new();
            pending.borrow_mut().push(c.clone());
            c
        }
    };
    Collection::new(
        CollectionConfig::new("todos", key_of)
            .sync(source.clone())
            .on_insert(parked(pending))
            .on_update(parked(pending))
            .on_delete(parked(pending))
            .start_sync(true),
    )
}

type Events = Rc<RefCell<Vec<Vec<(ChangeKind, Key)>>>>;

fn record(collection: &Collection) -> (Events, rill_reactive::CollectionSubscription) {
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    let seen = events.clone();
    let sub = collection
        .subscribe_changes(
            move |changes: &ChangeSet| {
                seen.borrow_mut()
                    .push(changes.iter().map(|c| (c.kind, c.key.clone())).collect())
            },
            SubscribeOptions::new(),
        )
        .unwrap();
    (events, sub)
}

/// A synced collection with `rows` and a subscriber that saw them arrive.
///
/// The recorded events start empty.
fn setup(rows: &[Value]) -> (TestSource, Rc<RefCell<Vec<Completion>>>, Collection, Events, rill_reactive::CollectionSubscription) {
    let source = TestSource::default();
    let pending = Rc::new(RefCell::new(Vec::new()));
    let collection = todos(&source, &pending);
    let (events, sub) = record(&collection);
    source.sync_rows(false, rows);
    events.borrow_mut().clear();
    (source, pending, collection, events, sub)
}

fn count(events: &Events, kind: ChangeKind, key: &Key) -> usize {
    events
        .borrow()
        .iter()
        .flatten()
        .filter(|(k, id)| *k == kind && id == key)
        .count()
}

#[test]
fn truncate_preserves_optimistic_insert() {
    let (source, _pending, collection, events, _sub) = setup(&[row(1, "server")]);

    collection.insert(row(2, "optimistic")).unwrap();
    source.sync_rows(true, &[row(1, "server")]);

    assert_eq!(collection.keys(), vec![Key::Int(1), Key::Int(2)]);
    assert_eq!(count(&events, ChangeKind::Insert, &Key::Int(2)), 1);
    assert_eq!(count(&events, ChangeKind::Delete, &Key::Int(2)), 0);
    assert_eq!(count(&events, ChangeKind::Delete, &Key::Int(1)), 0);
}

#[test]
fn optimistic_value_wins_over_resync() {
    let source = TestSource::default();
    let pending = Rc::new(RefCell::new(Vec::new()));
    let collection = todos(&source, &pending);
    source.sync_rows(false, &[row(1, "server-value-1")]);

    collection
        .update(&Key::Int(1), |v| with_value(v, "optimistic-value"))
        .unwrap();
    source.sync_rows(true, &[row(1, "server-value-2")]);

    assert_eq!(collection.get(&Key::Int(1)), Some(row(1, "optimistic-value")));

    pending.borrow()[0].reject(Error::invalid_operation("conflict"));
    assert_eq!(collection.get(&Key::Int(1)), Some(row(1, "server-value-2")));
}

#[test]
fn optimistic_delete_survives_truncate() {
    let (source, pending, collection, events, _sub) = setup(&[row(1, "a"), row(2, "b")]);

    collection.delete(&Key::Int(1)).unwrap();
    source.sync_rows(true, &[row(1, "a"), row(2, "b")]);

    assert!(!collection.has(&Key::Int(1)));
    assert_eq!(count(&events, ChangeKind::Insert, &Key::Int(1)), 0);
    assert_eq!(count(&events, ChangeKind::Delete, &Key::Int(1)), 1);

    pending.borrow()[0].resolve();
    assert!(!collection.has(&Key::Int(1)));
}

#[test]
fn mutation_during_open_truncate_is_layered_on_top() {
    let source = TestSource::default();
    let pending = Rc::new(RefCell::new(Vec::new()));
    let collection = todos(&source, &pending);
    source.sync_rows(false, &[row(1, "a")]);

    let handle = source.handle();
    handle.begin().unwrap();
    handle.truncate().unwrap();
    collection.insert(row(3, "late")).unwrap();
    handle.write(SyncOperation::Insert(row(1, "a"))).unwrap();
    handle.commit().unwrap();

    assert_eq!(collection.keys(), vec![Key::Int(1), Key::Int(3)]);
    assert_eq!(collection.pending_transactions().len(), 1);
}

#[derive(Clone, Copy, Debug)]
enum Confirm {
    BeforeTruncate,
    DuringTruncate,
    AfterTruncate,
}

fn confirm_around_truncate(when: Confirm) -> Vec<(Key, Value)> {
    let source = TestSource::default();
    let pending = Rc::new(RefCell::new(Vec::new()));
    let collection = todos(&source, &pending);
    source.sync_rows(false, &[row(1, "a")]);
    collection.insert(row(2, "mine")).unwrap();
    let confirm = || pending.borrow()[0].resolve();

    if let Confirm::BeforeTruncate = when {
        confirm();
    }
    let handle = source.handle();
    handle.begin().unwrap();
    handle.truncate().unwrap();
    if let Confirm::DuringTruncate = when {
        confirm();
    }
    handle.write(SyncOperation::Insert(row(1, "a"))).unwrap();
    handle.write(SyncOperation::Insert(row(2, "mine"))).unwrap();
    handle.commit().unwrap();
    if let Confirm::AfterTruncate = when {
        confirm();
    }

    assert!(collection.pending_transactions().is_empty(), "{:?}", when);
    collection.entries()
}

#[test]
fn confirmation_timing_does_not_change_final_state() {
    let before = confirm_around_truncate(Confirm::BeforeTruncate);
    let during = confirm_around_truncate(Confirm::DuringTruncate);
    let after = confirm_around_truncate(Confirm::AfterTruncate);
    assert_eq!(before, vec![(Key::Int(1), row(1, "a")), (Key::Int(2), row(2, "mine"))]);
    assert_eq!(before, during);
    assert_eq!(during, after);
}

#[test]
fn confirmation_during_truncate_keeps_row_the_server_omitted() {
    let source = TestSource::default();
    let pending = Rc::new(RefCell::new(Vec::new()));
    let collection = todos(&source, &pending);
    source.sync_rows(false, &[row(1, "a")]);
    collection.insert(row(2, "mine")).unwrap();

    let handle = source.handle();
    handle.begin().unwrap();
    handle.truncate().unwrap();
    pending.borrow()[0].resolve();
    handle.write(SyncOperation::Insert(row(1, "a"))).unwrap();
    handle.commit().unwrap();

    assert_eq!(collection.get(&Key::Int(2)), Some(row(2, "mine")));
}

fn stamped(v: Value) -> Value {
    let mut v = v;
    v.set_field("created_at", Value::Int64(1_700_000_000));
    v
}

#[test]
fn confirmed_insert_accepts_server_row_with_extra_fields() {
    let (source, pending, collection, events, _sub) = setup(&[row(1, "a")]);
    collection.insert(row(2, "mine")).unwrap();
    pending.borrow()[0].resolve();
    assert_eq!(collection.get(&Key::Int(2)), Some(row(2, "mine")));

    let handle = source.handle();
    handle.begin().unwrap();
    handle.write(SyncOperation::Insert(stamped(row(2, "mine")))).unwrap();
    assert!(handle.commit().is_ok());

    assert_eq!(collection.get(&Key::Int(2)), Some(stamped(row(2, "mine"))));
    assert_eq!(count(&events, ChangeKind::Update, &Key::Int(2)), 1);
    assert!(collection.pending_transactions().is_empty());
}

#[test]
fn server_row_arriving_before_confirmation_shows_after_it() {
    let (source, pending, collection, _events, _sub) = setup(&[row(1, "a")]);
    collection.insert(row(2, "mine")).unwrap();

    let handle = source.handle();
    handle.begin().unwrap();
    handle.write(SyncOperation::Insert(stamped(row(2, "mine")))).unwrap();
    handle.commit().unwrap();
    assert_eq!(collection.get(&Key::Int(2)), Some(row(2, "mine")));

    pending.borrow()[0].resolve();
    assert_eq!(collection.get(&Key::Int(2)), Some(stamped(row(2, "mine"))));
}

#[test]
fn confirmed_update_accepts_server_echo() {
    let (source, pending, collection, _events, _sub) = setup(&[row(1, "a")]);
    collection.update(&Key::Int(1), |v| with_value(v, "edited")).unwrap();
    pending.borrow()[0].resolve();

    let handle = source.handle();
    handle.begin().unwrap();
    handle.write(SyncOperation::Update(stamped(row(1, "edited")))).unwrap();
    handle.commit().unwrap();

    assert_eq!(collection.get(&Key::Int(1)), Some(stamped(row(1, "edited"))));
}

#[test]
fn truncate_reports_minimal_diff() {
    let (source, _pending, _collection, events, _sub) = setup(&[row(1, "a"), row(2, "b")]);

    source.sync_rows(true, &[row(2, "b"), row(3, "c")]);

    assert_eq!(
        *events.borrow(),
        vec![vec![(ChangeKind::Delete, Key::Int(1)), (ChangeKind::Insert, Key::Int(3))]]
    );
}

#[test]
fn rejected_update_restores_previous_value() {
    let (_source, pending, collection, events, _sub) = setup(&[row(1, "server")]);

    collection.update(&Key::Int(1), |v| with_value(v, "first")).unwrap();
    collection.insert(row(2, "other")).unwrap();
    pending.borrow()[0].reject(Error::invalid_operation("denied"));

    assert_eq!(collection.get(&Key::Int(1)), Some(row(1, "server")));
    assert_eq!(collection.get(&Key::Int(2)), Some(row(2, "other")));
    assert_eq!(count(&events, ChangeKind::Update, &Key::Int(1)), 2);
}

// ---------------------------------------------------------------------------
// Buffering
// ---------------------------------------------------------------------------

/// A subscriber that received its rows through a bounded snapshot.
fn bounded_subscriber() -> (TestSource, Collection, Events, rill_reactive::CollectionSubscription) {
    let (source, _pending, collection, events, sub) = setup(&[row(1, "a"), row(2, "b")]);
    let load = sub.request_limited_snapshot(Vec::new(), 10).unwrap();
    source.resolve_loads();
    assert!(load.is_resolved());
    assert!(events.borrow().is_empty());
    (source, collection, events, sub)
}

#[test]
fn bounded_subscription_buffers_until_reload_resolves() {
    let (source, _collection, events, sub) = bounded_subscriber();
    assert_eq!(source.loads.borrow().len(), 1);

    source.sync_rows(true, &[row(3, "c"), row(4, "d")]);
    assert!(events.borrow().is_empty());
    assert!(sub.is_buffering());
    assert_eq!(source.loads.borrow().len(), 2);

    source.resolve_loads();
    assert!(!sub.is_buffering());
    assert_eq!(
        *events.borrow(),
        vec![vec![
            (ChangeKind::Delete, Key::Int(1)),
            (ChangeKind::Delete, Key::Int(2)),
            (ChangeKind::Insert, Key::Int(3)),
            (ChangeKind::Insert, Key::Int(4)),
        ]]
    );
}

#[test]
fn synchronous_reload_still_flushes_deletes_first() {
    let (source, _collection, events, sub) = bounded_subscriber();
    *source.synchronous_loads.borrow_mut() = true;

    source.sync_rows(true, &[row(3, "c")]);

    assert!(!sub.is_buffering());
    assert_eq!(
        *events.borrow(),
        vec![vec![
            (ChangeKind::Delete, Key::Int(1)),
            (ChangeKind::Delete, Key::Int(2)),
            (ChangeKind::Insert, Key::Int(3)),
        ]]
    );
}

#[test]
fn unbounded_subscription_is_not_buffered() {
    let (source, _pending, _collection, events, sub) = setup(&[row(1, "a")]);

    source.sync_rows(true, &[row(2, "b")]);

    assert!(!sub.is_buffering());
    assert_eq!(events.borrow().len(), 1);
    assert!(source.loads.borrow().is_empty());
}

#[test]
fn unsubscribe_while_buffered_drops_late_reload() {
    let (source, collection, events, sub) = bounded_subscriber();

    source.sync_rows(true, &[row(3, "c")]);
    sub.unsubscribe();
    source.resolve_loads();

    assert!(events.borrow().is_empty());
    assert_eq!(collection.subscriber_count(), 0);
}

#[test]
fn events_after_truncate_are_buffered_with_it() {
    let (source, _collection, events, _sub) = bounded_subscriber();

    source.sync_rows(true, &[row(3, "c")]);
    source.sync_rows(false, &[row(5, "e")]);
    assert!(events.borrow().is_empty());

    source.resolve_loads();
    let flushed = events.borrow();
    assert_eq!(flushed.len(), 1);
    assert_eq!(
        flushed[0],
        vec![
            (ChangeKind::Delete, Key::Int(1)),
            (ChangeKind::Delete, Key::Int(2)),
            (ChangeKind::Insert, Key::Int(3)),
            (ChangeKind::Insert, Key::Int(5)),
        ]
    );
}
