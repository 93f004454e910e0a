//! Live queries over synced collections.

use rill_core::{Completion, Error, Key, Result, Value};
use rill_query::ast::{Expr, FromClause, JoinType, OrderByClause, QueryIr};
use rill_query::{LoadSubsetOptions, LoadSubsetResult};
use rill_reactive::{
    Collection, CollectionConfig, CollectionStatus, LiveQueryCollection, LiveQueryConfig, SyncHandle, SyncOperation,
    SyncSource,
};
use std::cell::RefCell;
use std::rc::Rc;

fn key_of(v: &Value) -> Key {
    v.get_field("id").and_then(Key::from_value).unwrap_or(Key::Int(-1))
}

#[derive(Clone, Default)]
struct TestSource {
    handle: Rc<RefCell<Option<SyncHandle>>>,
    loads: Rc<RefCell<Vec<(LoadSubsetOptions, Completion)>>>,
}

impl SyncSource for TestSource {
    fn sync(&self, handle: SyncHandle) -> Result<()> {
        *self.handle.borrow_mut() = Some(handle);
        Ok(())
    }

    fn load_subset(&self, options: &LoadSubsetOptions) -> LoadSubsetResult {
        let completion = Completion::new();
        self.loads.borrow_mut().push((options.clone(), completion.clone()));
        LoadSubsetResult::Pending(completion)
    }
}

impl TestSource {
    fn handle(&self) -> SyncHandle {
        self.handle.borrow().clone().unwrap()
    }

    fn write(&self, ops: Vec<SyncOperation>) {
        let handle = self.handle();
        handle.begin().unwrap();
        for op in ops {
            handle.write(op).unwrap();
        }
        handle.commit().unwrap();
    }
}

fn synced(id: &str, rows: Vec<Value>) -> (Collection, TestSource) {
    let source = TestSource::default();
    let collection = Collection::new(CollectionConfig::new(id, key_of).sync(source.clone()).start_sync(true));
    source.write(rows.into_iter().map(SyncOperation::Insert).collect());
    source.handle().mark_ready().unwrap();
    (collection, source)
}

fn task(id: i64, active: bool, priority: i64) -> Value {
    Value::object([
        ("id", Value::Int64(id)),
        ("active", Value::Boolean(active)),
        ("priority", Value::Int64(priority)),
    ])
}

fn active_tasks(limit: usize) -> QueryIr {
    QueryIr::from_collection("tasks", "t")
        .with_where(Expr::eq(Expr::field("t", "active"), Expr::val(true)))
        .with_limit(limit)
}

#[test]
fn identical_limited_queries_load_once() {
    let (tasks, source) = synced("tasks", (1..=30).map(|i| task(i, i % 2 == 0, i % 10)).collect());

    let first = LiveQueryCollection::new(LiveQueryConfig::new("a", active_tasks(10)).with_collection(&tasks)).unwrap();
    let second = LiveQueryCollection::new(LiveQueryConfig::new("b", active_tasks(10)).with_collection(&tasks)).unwrap();
    assert_eq!(source.loads.borrow().len(), 1);

    let smaller = LiveQueryCollection::new(LiveQueryConfig::new("c", active_tasks(5)).with_collection(&tasks)).unwrap();
    assert_eq!(source.loads.borrow().len(), 1);

    let narrower = active_tasks(7).with_where(Expr::gt(Expr::field("t", "priority"), Expr::val(5i64)));
    let narrower = LiveQueryCollection::new(LiveQueryConfig::new("d", narrower).with_collection(&tasks)).unwrap();
    assert_eq!(source.loads.borrow().len(), 2);

    let (options, _) = source.loads.borrow()[0].clone();
    assert_eq!(options.limit, Some(10));
    assert_eq!(options.where_expr, Some(Expr::eq(Expr::reference(["active"]), Expr::val(true))));

    assert_eq!(first.len(), 10);
    assert_eq!(second.len(), 10);
    assert_eq!(smaller.len(), 5);
    assert!(narrower.to_vec().iter().all(|t| t.get_field("priority").and_then(|p| p.as_i64()) > Some(5)));
}

#[test]
fn join_with_projection_follows_both_sides() {
    let (users, _) = synced(
        "users",
        vec![
            Value::object([("id", Value::Int64(1)), ("name", Value::from("ann"))]),
            Value::object([("id", Value::Int64(2)), ("name", Value::from("bob"))]),
        ],
    );
    let (posts, post_source) = synced(
        "posts",
        vec![Value::object([
            ("id", Value::Int64(10)),
            ("user_id", Value::Int64(1)),
            ("title", Value::from("hello")),
        ])],
    );
    let query = QueryIr::from_collection("users", "u")
        .with_join(
            JoinType::Inner,
            FromClause::collection("posts", "p"),
            Expr::field("u", "id"),
            Expr::field("p", "user_id"),
        )
        .with_select([("name", Expr::field("u", "name")), ("title", Expr::field("p", "title"))])
        .with_order_by(OrderByClause::asc(Expr::field("p", "title")));
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new("feed", query)
            .with_collection(&users)
            .with_collection(&posts),
    )
    .unwrap();
    assert!(live.is_ready());
    assert_eq!(
        live.to_vec(),
        vec![Value::object([("name", Value::from("ann")), ("title", Value::from("hello"))])]
    );

    post_source.write(vec![SyncOperation::Insert(Value::object([
        ("id", Value::Int64(11)),
        ("user_id", Value::Int64(2)),
        ("title", Value::from("abc")),
    ]))]);
    let titles: Vec<Value> = live
        .to_vec()
        .iter()
        .filter_map(|row| row.get_field("title").cloned())
        .collect();
    assert_eq!(titles, vec![Value::from("abc"), Value::from("hello")]);

    post_source.write(vec![SyncOperation::Delete(Key::Int(10))]);
    assert_eq!(live.len(), 1);
}

#[test]
fn optimistic_mutations_show_through_live_query() {
    let pending = Rc::new(RefCell::new(Vec::new()));
    let parked = pending.clone();
    let source = TestSource::default();
    let tasks = Collection::new(
        CollectionConfig::new("tasks", key_of)
            .sync(source.clone())
            .on_insert(move |_| {
                let c = Completion::new();
                parked.borrow_mut().push(c.clone());
                c
            })
            .start_sync(true),
    );
    source.handle().mark_ready().unwrap();
    let query = QueryIr::from_collection("tasks", "t").with_where(Expr::eq(Expr::field("t", "active"), Expr::val(true)));
    let live = LiveQueryCollection::new(LiveQueryConfig::new("active", query).with_collection(&tasks)).unwrap();

    tasks.insert(task(1, true, 1)).unwrap();
    tasks.insert(task(2, false, 1)).unwrap();
    assert_eq!(live.collection().keys(), vec![Key::Int(1)]);

    pending.borrow()[0].reject(Error::invalid_operation("denied"));
    assert!(live.is_empty());
}

#[test]
fn source_error_moves_live_query_to_error_and_keeps_rows() {
    let (users, user_source) = synced("users", vec![Value::object([("id", Value::Int64(1))])]);
    let (posts, _) = synced(
        "posts",
        vec![Value::object([("id", Value::Int64(10)), ("user_id", Value::Int64(1))])],
    );
    let query = QueryIr::from_collection("users", "u").with_join(
        JoinType::Left,
        FromClause::collection("posts", "p"),
        Expr::field("u", "id"),
        Expr::field("p", "user_id"),
    );
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new("joined", query)
            .with_collection(&users)
            .with_collection(&posts),
    )
    .unwrap();
    let statuses = Rc::new(RefCell::new(Vec::new()));
    let seen = statuses.clone();
    live.collection().on_status_change(move |s| seen.borrow_mut().push(s));
    assert_eq!(live.len(), 1);

    user_source.handle().fail("disconnected").unwrap();

    assert_eq!(live.status(), CollectionStatus::Error);
    assert_eq!(*statuses.borrow(), vec![CollectionStatus::Error]);
    assert_eq!(live.len(), 1);
    assert!(live.preload().is_rejected());
}

#[test]
fn live_query_waits_for_every_source() {
    let (users, _) = synced("users", Vec::new());
    let posts_source = TestSource::default();
    let posts = Collection::new(CollectionConfig::new("posts", key_of).sync(posts_source.clone()).start_sync(true));
    let query = QueryIr::from_collection("users", "u").with_join(
        JoinType::Inner,
        FromClause::collection("posts", "p"),
        Expr::field("u", "id"),
        Expr::field("p", "user_id"),
    );
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new("joined", query)
            .with_collection(&users)
            .with_collection(&posts),
    )
    .unwrap();
    let ready = live.preload();
    assert_eq!(live.status(), CollectionStatus::Loading);
    assert!(ready.is_pending());

    posts_source.handle().mark_ready().unwrap();
    assert!(live.is_ready());
    assert!(ready.is_resolved());
}

// ---------------------------------------------------------------------------
// Ordered windows
// ---------------------------------------------------------------------------

/// Ten active tasks with distinct priorities 0, 2, .., 18, plus ten
/// inactive ones.
fn prioritized() -> (Collection, TestSource) {
    synced("tasks", (1..=20).map(|i| task(i, i % 2 == 0, (i * 7) % 20)).collect())
}

fn by_priority(limit: usize) -> QueryIr {
    QueryIr::from_collection("tasks", "t")
        .with_where(Expr::eq(Expr::field("t", "active"), Expr::val(true)))
        .with_order_by(OrderByClause::asc(Expr::field("t", "priority")))
        .with_limit(limit)
}

fn priorities(live: &LiveQueryCollection) -> Vec<i64> {
    live.to_vec()
        .iter()
        .filter_map(|t| t.get_field("priority").and_then(|p| p.as_i64()))
        .collect()
}

#[test]
fn ordered_window_is_the_sorted_slice() {
    let (tasks, _source) = prioritized();
    let live = LiveQueryCollection::new(LiveQueryConfig::new("top", by_priority(3)).with_collection(&tasks)).unwrap();

    assert_eq!(priorities(&live), vec![0, 2, 4]);
    let keys: Vec<Key> = live.entries().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![Key::Int(20), Key::Int(6), Key::Int(12)]);

    let indices: Vec<String> = keys.iter().map(|k| live.order_index(k).unwrap()).collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]), "{:?}", indices);
    assert_eq!(live.order_index(&Key::Int(2)), None);
}

#[test]
fn set_window_grows_shrinks_and_drops_the_limit() {
    let (tasks, source) = prioritized();
    let live = LiveQueryCollection::new(LiveQueryConfig::new("top", by_priority(3)).with_collection(&tasks)).unwrap();

    live.set_window(0, Some(5)).unwrap();
    assert_eq!(priorities(&live), vec![0, 2, 4, 6, 8]);
    assert_eq!(source.loads.borrow().last().unwrap().0.limit, Some(5));

    live.set_window(2, Some(2)).unwrap();
    assert_eq!(priorities(&live), vec![4, 6]);

    live.set_window(0, None).unwrap();
    assert_eq!(priorities(&live), vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
    assert_eq!(live.len(), 10);
}

#[test]
fn set_window_requires_an_ordered_query() {
    let (tasks, _source) = prioritized();
    let query = QueryIr::from_collection("tasks", "t");
    let live = LiveQueryCollection::new(LiveQueryConfig::new("all", query).with_collection(&tasks)).unwrap();
    assert!(live.set_window(0, Some(2)).is_err());
}

#[test]
fn deleting_a_window_row_pulls_in_the_next() {
    let (tasks, source) = prioritized();
    let live = LiveQueryCollection::new(LiveQueryConfig::new("top", by_priority(3)).with_collection(&tasks)).unwrap();
    assert_eq!(priorities(&live), vec![0, 2, 4]);

    source.write(vec![SyncOperation::Delete(Key::Int(20))]);
    assert_eq!(priorities(&live), vec![2, 4, 6]);
    assert_eq!(live.get(&Key::Int(18)), Some(task(18, true, 6)));

    // A row sorting ahead of the window pushes the last one out.
    source.write(vec![SyncOperation::Insert(task(21, true, -1))]);
    assert_eq!(priorities(&live), vec![-1, 2, 4]);
    assert!(live.get(&Key::Int(18)).is_none());
}
