//! Live query collections.
//!
//! A `LiveQueryCollection` keeps the result of a query over other collections
//! up to date. The query is optimized and compiled into a dataflow graph; one
//! subscription per source occurrence feeds the graph, and the graph's net
//! output is written into an output `Collection` through the regular sync
//! protocol, so consumers subscribe to a live query exactly like to any
//! other collection.
//!
//! A single-source query with a LIMIT only asks its source for the rows it
//! needs (`request_limited_snapshot`), and asks for more when rows leave the
//! window.

use crate::change_set::ChangeSet;
use crate::collection::{
    Collection, CollectionConfig, CollectionStatus, RowUpdateMode, SyncHandle, SyncOperation, SyncSource,
};
use crate::subscription::{CollectionSubscription, SubscribeOptions};
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use hashbrown::HashMap;
use rill_core::{debug_log, Completion, Error, Key, Result, Value};
use rill_incremental::Delta;
use rill_query::ast::{FromClause, OrderByClause, QueryIr};
use rill_query::{compile_query, optimize_query, CompiledQuery, PipelineRow};

/// Builder for a live query.
pub struct LiveQueryConfig {
    id: String,
    query: QueryIr,
    collections: BTreeMap<String, Collection>,
}

impl LiveQueryConfig {
    pub fn new(id: impl Into<String>, query: QueryIr) -> Self {
        Self {
            id: id.into(),
            query,
            collections: BTreeMap::new(),
        }
    }

    /// Makes `collection` available to the query under its own id.
    pub fn with_collection(mut self, collection: &Collection) -> Self {
        self.collections.insert(collection.id(), collection.clone());
        self
    }
}

/// Hands the output collection's sync handle back to the live query.
struct OutputSource {
    handle: Rc<RefCell<Option<SyncHandle>>>,
}

impl SyncSource for OutputSource {
    fn sync(&self, handle: SyncHandle) -> Result<()> {
        *self.handle.borrow_mut() = Some(handle);
        Ok(())
    }
}

struct SourceBinding {
    collection: Collection,
    subscription: Option<CollectionSubscription>,
    status_listener: u64,
}

/// Window bookkeeping of a limited single-source query.
struct LimitedLoad {
    order_by: Vec<OrderByClause>,
    /// Rows the window needs.
    window: usize,
    /// Rows requested from the subscription so far.
    requested: usize,
    /// Window size seen by the previous flush.
    last_size: usize,
}

struct LiveState {
    compiled: CompiledQuery,
    sources: Vec<SourceBinding>,
    limited: Option<LimitedLoad>,
    order_index: HashMap<Key, String>,
}

struct LiveShared {
    id: String,
    output: Collection,
    output_handle: SyncHandle,
    optimized: QueryIr,
    /// Output deltas collected by the graph sink during `run`.
    pending: Rc<RefCell<Vec<Delta<PipelineRow>>>>,
    state: RefCell<LiveState>,
    flushing: Cell<bool>,
    /// Source changes arrived since the last graph run.
    dirty: Cell<bool>,
}

/// A collection whose rows are the live result of a query.
pub struct LiveQueryCollection {
    shared: Rc<LiveShared>,
}

impl LiveQueryCollection {
    /// Optimizes and compiles the query, subscribes to its sources and loads
    /// the initial result.
    pub fn new(config: LiveQueryConfig) -> Result<Self> {
        let optimization = optimize_query(&config.query)?;
        let pending: Rc<RefCell<Vec<Delta<PipelineRow>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = pending.clone();
        let compiled = compile_query(&optimization.query, move |batch: &[Delta<PipelineRow>]| {
            sink.borrow_mut().extend_from_slice(batch)
        })?;

        let mut collections = Vec::with_capacity(compiled.inputs().len());
        for input in compiled.inputs() {
            let collection = config
                .collections
                .get(&input.collection)
                .ok_or_else(|| Error::not_found(format!("collection '{}'", input.collection)))?;
            collections.push((input.alias.clone(), collection.clone()));
        }

        let handle_slot = Rc::new(RefCell::new(None));
        let output = Collection::new(
            CollectionConfig::new(config.id.clone(), output_key)
                .sync(OutputSource {
                    handle: handle_slot.clone(),
                })
                .row_update_mode(RowUpdateMode::Full)
                .start_sync(true),
        );
        let output_handle = handle_slot
            .borrow_mut()
            .take()
            .ok_or_else(|| Error::invalid_operation("output collection did not start syncing"))?;

        let limited = limited_load(&config.query);
        let shared = Rc::new(LiveShared {
            id: config.id,
            output,
            output_handle,
            optimized: optimization.query,
            pending,
            state: RefCell::new(LiveState {
                compiled,
                sources: Vec::new(),
                limited,
                order_index: HashMap::new(),
            }),
            flushing: Cell::new(false),
            dirty: Cell::new(false),
        });
        let live = Self { shared };

        for (index, (alias, collection)) in collections.into_iter().enumerate() {
            let where_expression = optimization
                .source_where_clauses
                .get(&alias)
                .map(|expr| expr.strip_alias(&alias));
            let weak = Rc::downgrade(&live.shared);
            let listener = collection.on_status_change(move |_| {
                if let Some(shared) = weak.upgrade() {
                    update_status(&shared);
                }
            });
            live.shared.state.borrow_mut().sources.push(SourceBinding {
                collection: collection.clone(),
                subscription: None,
                status_listener: listener,
            });

            let weak = Rc::downgrade(&live.shared);
            let subscription = collection.subscribe_changes(
                move |changes: &ChangeSet| {
                    if let Some(shared) = weak.upgrade() {
                        on_source_changes(&shared, index, changes);
                    }
                },
                SubscribeOptions {
                    include_initial_state: false,
                    where_expression,
                },
            )?;
            live.shared.state.borrow_mut().sources[index].subscription = Some(subscription.clone());

            let window = {
                let state = live.shared.state.borrow();
                state.limited.as_ref().map(|l| (l.order_by.clone(), l.requested))
            };
            match window {
                Some((order_by, limit)) => {
                    subscription.request_limited_snapshot(order_by, limit)?;
                }
                None => {
                    subscription.request_snapshot(None)?;
                }
            }
        }

        flush(&live.shared);
        update_status(&live.shared);
        Ok(live)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The output collection holding the current result.
    pub fn collection(&self) -> &Collection {
        &self.shared.output
    }

    /// The query as compiled, after optimization.
    pub fn optimized_query(&self) -> &QueryIr {
        &self.shared.optimized
    }

    pub fn status(&self) -> CollectionStatus {
        self.shared.output.status()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.output.is_ready()
    }

    pub fn error(&self) -> Option<Error> {
        self.shared.output.error()
    }

    /// Resolves once every source is ready.
    pub fn preload(&self) -> Completion {
        self.shared.output.preload()
    }

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.shared.output.get(key)
    }

    pub fn len(&self) -> usize {
        self.shared.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.output.is_empty()
    }

    /// Fractional index of a row, when the query is ordered.
    pub fn order_index(&self, key: &Key) -> Option<String> {
        self.shared.state.borrow().order_index.get(key).cloned()
    }

    /// Result rows, in query order when ordered, else in key order.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        let mut entries = self.shared.output.entries();
        let state = self.shared.state.borrow();
        if !state.order_index.is_empty() {
            entries.sort_by(|(a, _), (b, _)| {
                state
                    .order_index
                    .get(a)
                    .cmp(&state.order_index.get(b))
                    .then_with(|| a.cmp(b))
            });
        }
        entries
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    /// Subscribes to changes of the result.
    pub fn subscribe_changes<F>(&self, callback: F, options: SubscribeOptions) -> Result<CollectionSubscription>
    where
        F: Fn(&ChangeSet) + 'static,
    {
        self.shared.output.subscribe_changes(callback, options)
    }

    /// Moves the ordered window. Loads more source rows when needed.
    ///
    /// Dropping the limit of a limited query loads every matching source row
    /// and stops the windowed loading for good.
    pub fn set_window(&self, offset: usize, limit: Option<usize>) -> Result<()> {
        let request = {
            let mut state = self.shared.state.borrow_mut();
            let handle = state
                .compiled
                .order()
                .cloned()
                .ok_or_else(|| Error::invalid_operation("set_window requires ORDER BY, LIMIT or OFFSET"))?;
            handle.set_window(offset, limit);
            let subscription = state.sources.first().and_then(|s| s.subscription.clone());
            match (limit, subscription) {
                (_, None) => WindowLoad::Nothing,
                (None, Some(subscription)) => match state.limited.take() {
                    Some(_) => WindowLoad::Everything(subscription),
                    None => WindowLoad::Nothing,
                },
                (Some(limit), Some(subscription)) => match state.limited.as_mut() {
                    Some(load) => {
                        load.window = offset + limit;
                        if load.window > load.requested {
                            load.requested = load.window;
                        }
                        WindowLoad::Limited(subscription, load.order_by.clone(), load.requested)
                    }
                    None => WindowLoad::Nothing,
                },
            }
        };
        match request {
            WindowLoad::Limited(subscription, order_by, requested) => {
                subscription.request_limited_snapshot(order_by, requested)?;
            }
            WindowLoad::Everything(subscription) => {
                subscription.request_snapshot(None)?;
            }
            WindowLoad::Nothing => {}
        }
        flush(&self.shared);
        Ok(())
    }

    /// Detaches from the sources and cleans up the output collection.
    pub fn cleanup(&self) {
        detach(&self.shared);
        self.shared.output.cleanup();
    }
}

impl Drop for LiveQueryCollection {
    fn drop(&mut self) {
        detach(&self.shared);
    }
}

impl core::fmt::Debug for LiveQueryCollection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LiveQueryCollection")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .field("len", &self.len())
            .finish()
    }
}

/// Key function of the output collection. Rows are written under their
/// pipeline keys, so this only serves callers writing rows by value.
fn output_key(value: &Value) -> Key {
    value
        .get_field("id")
        .and_then(Key::from_value)
        .unwrap_or_else(|| Key::Str(value.to_string()))
}

/// Source load triggered by a window move.
enum WindowLoad {
    Nothing,
    Limited(CollectionSubscription, Vec<OrderByClause>, usize),
    Everything(CollectionSubscription),
}

/// Window bookkeeping when the query reads one collection through a LIMIT
/// and every WHERE condition can be evaluated by the source subscription.
fn limited_load(query: &QueryIr) -> Option<LimitedLoad> {
    let limit = query.limit?;
    let FromClause::Collection { alias, .. } = &query.from else {
        return None;
    };
    if !query.join.is_empty() || !query.fn_where.is_empty() || query.is_grouped() || query.distinct {
        return None;
    }
    let pushable = query.where_clauses.iter().all(|w| {
        let mut refs = Vec::new();
        w.expression.collect_refs(&mut refs);
        !refs.is_empty()
            && refs
                .iter()
                .all(|r| r.alias() == Some(alias.as_str()) && !r.is_namespace_only())
    });
    if !pushable {
        return None;
    }
    let window = query.offset.unwrap_or(0) + limit;
    Some(LimitedLoad {
        order_by: query
            .order_by
            .iter()
            .map(|c| OrderByClause::new(c.expression.strip_alias(alias), c.compare.clone()))
            .collect(),
        window,
        requested: window,
        last_size: 0,
    })
}

fn on_source_changes(shared: &Rc<LiveShared>, input: usize, changes: &ChangeSet) {
    let sent = shared.state.borrow_mut().compiled.send(input, changes.to_deltas());
    if let Err(err) = sent {
        debug_log!("live query {}: {}", shared.id, err);
        let _ = shared.output_handle.fail(err.to_string());
        return;
    }
    shared.dirty.set(true);
    flush(shared);
}

/// Runs the graph until no source changes remain and writes the output.
///
/// Re-entrant calls (source changes delivered while flushing) only mark the
/// query dirty; the outer call picks them up.
fn flush(shared: &Rc<LiveShared>) {
    if shared.flushing.replace(true) {
        return;
    }
    loop {
        let had_changes = shared.dirty.replace(false);
        if let Err(err) = run_and_write(shared) {
            debug_log!("live query {}: {}", shared.id, err);
            let _ = shared.output_handle.fail(err.to_string());
            break;
        }
        if had_changes {
            load_more(shared);
        }
        if !shared.dirty.get() {
            break;
        }
    }
    shared.flushing.set(false);
}

fn run_and_write(shared: &Rc<LiveShared>) -> Result<()> {
    let batch = {
        let mut state = shared.state.borrow_mut();
        state.compiled.run()?;
        core::mem::take(&mut *shared.pending.borrow_mut())
    };
    if batch.is_empty() {
        return Ok(());
    }

    // Net effect per key: multiplicity change and the last asserted row.
    let mut net: BTreeMap<Key, (i32, Option<PipelineRow>)> = BTreeMap::new();
    for delta in batch {
        let entry = net.entry(delta.data.key.clone()).or_insert((0, None));
        entry.0 += delta.diff;
        if delta.diff > 0 {
            entry.1 = Some(delta.data);
        }
    }

    let mut writes: Vec<(Key, SyncOperation)> = Vec::new();
    {
        let mut state = shared.state.borrow_mut();
        for (key, (diff, row)) in net {
            let present = shared.output.has(&key);
            let now_present = present as i32 + diff > 0;
            match (present, now_present, row) {
                (_, true, Some(row)) => {
                    if let Some(index) = &row.order_index {
                        state.order_index.insert(key.clone(), index.clone());
                    }
                    let value = row.output();
                    let op = if present {
                        SyncOperation::Update(value)
                    } else {
                        SyncOperation::Insert(value)
                    };
                    writes.push((key, op));
                }
                (true, false, _) => {
                    state.order_index.remove(&key);
                    writes.push((key.clone(), SyncOperation::Delete(key)));
                }
                _ => {}
            }
        }
    }
    if writes.is_empty() {
        return Ok(());
    }

    let handle = &shared.output_handle;
    handle.begin()?;
    for (key, op) in writes {
        handle.write_keyed(key, op)?;
    }
    handle.commit()
}

/// Requests more source rows when rows left a window that is now short.
fn load_more(shared: &Rc<LiveShared>) {
    let request = {
        let mut state = shared.state.borrow_mut();
        let size = state.compiled.order().map(|h| h.size());
        let subscription = state.sources.first().and_then(|s| s.subscription.clone());
        match (state.limited.as_mut(), size) {
            (Some(load), Some(size)) => {
                let shrunk = size < load.last_size && size < load.window;
                load.last_size = size;
                match subscription {
                    Some(subscription) if shrunk => {
                        load.requested += load.window - size;
                        Some((subscription, load.order_by.clone(), load.requested))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    };
    if let Some((subscription, order_by, requested)) = request {
        if let Err(err) = subscription.request_limited_snapshot(order_by, requested) {
            debug_log!("live query {}: loading more rows failed: {}", shared.id, err);
        }
    }
}

/// Mirrors the source statuses onto the output collection.
fn update_status(shared: &Rc<LiveShared>) {
    let statuses: Vec<(String, CollectionStatus)> = shared
        .state
        .borrow()
        .sources
        .iter()
        .map(|s| (s.collection.id(), s.collection.status()))
        .collect();
    let failed = statuses
        .iter()
        .find(|(_, status)| matches!(status, CollectionStatus::Error | CollectionStatus::CleanedUp));
    if let Some((source, status)) = failed {
        if shared.output.status() != CollectionStatus::Error {
            debug_log!("live query {}: source {} is {}", shared.id, source, status);
            let _ = shared
                .output_handle
                .fail(format!("source collection '{}' is {}", source, status));
        }
        return;
    }
    if statuses.iter().all(|(_, status)| *status == CollectionStatus::Ready) {
        let _ = shared.output_handle.mark_ready();
    }
}

fn detach(shared: &Rc<LiveShared>) {
    let sources = core::mem::take(&mut shared.state.borrow_mut().sources);
    for source in sources {
        source.collection.remove_status_listener(source.status_listener);
        if let Some(subscription) = source.subscription {
            subscription.unsubscribe();
        }
    }
}
