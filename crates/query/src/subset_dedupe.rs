//! Deduplication of subset loads.
//!
//! Several live queries over the same source often ask for overlapping data.
//! `DeduplicatedLoadSubset` remembers what has been loaded and what is in
//! flight, and only forwards requests that are not already covered:
//!
//! - an unlimited request is covered by the union of earlier unlimited
//!   predicates, and is narrowed to the uncovered part before forwarding
//! - a limited request is covered only by an earlier limited request with a
//!   structurally equal predicate and a window that contains it
//! - a request matching an in-flight request shares its completion
//!
//! `reset` forgets everything, and completions from before the reset no longer
//! update the tracking.

use crate::ast::Expr;
use crate::load::{LoadSubsetFn, LoadSubsetOptions, LoadSubsetResult};
use crate::predicate::{
    is_predicate_subset, is_where_subset, minus_where_predicates, union_where_predicates,
};
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use rill_core::{debug_log, Completion, CompletionState};

/// Callback invoked when a request is served without reaching the source.
pub type OnDeduplicateFn = Rc<dyn Fn(&LoadSubsetOptions)>;

struct InFlight {
    id: u64,
    options: LoadSubsetOptions,
    completion: Completion,
}

#[derive(Default)]
struct Tracking {
    unlimited_where: Option<Expr>,
    has_loaded_all_data: bool,
    limited_calls: Vec<LoadSubsetOptions>,
    in_flight: Vec<InFlight>,
    generation: u64,
    next_id: u64,
}

impl Tracking {
    fn record(&mut self, options: &LoadSubsetOptions) {
        if options.limit.is_some() {
            self.limited_calls.push(options.clone());
            return;
        }
        match (&options.where_expr, self.unlimited_where.take()) {
            (None, _) => {
                self.has_loaded_all_data = true;
                self.limited_calls.clear();
                self.in_flight.clear();
            }
            (Some(w), None) => self.unlimited_where = Some(w.clone()),
            (Some(w), Some(existing)) => {
                self.unlimited_where = Some(union_where_predicates(&[existing, w.clone()]));
            }
        }
    }

    fn is_covered(&self, options: &LoadSubsetOptions) -> bool {
        if self.has_loaded_all_data {
            return true;
        }
        if let (Some(loaded), Some(wanted)) = (&self.unlimited_where, &options.where_expr) {
            if is_where_subset(Some(wanted), Some(loaded)) {
                return true;
            }
        }
        options.limit.is_some()
            && self
                .limited_calls
                .iter()
                .any(|loaded| is_predicate_subset(options, loaded))
    }
}

/// Wraps a subset loader with request deduplication.
#[derive(Clone)]
pub struct DeduplicatedLoadSubset {
    loader: LoadSubsetFn,
    on_deduplicate: Option<OnDeduplicateFn>,
    tracking: Rc<RefCell<Tracking>>,
}

impl DeduplicatedLoadSubset {
    pub fn new(loader: LoadSubsetFn) -> Self {
        Self {
            loader,
            on_deduplicate: None,
            tracking: Rc::new(RefCell::new(Tracking::default())),
        }
    }

    pub fn with_on_deduplicate(mut self, f: OnDeduplicateFn) -> Self {
        self.on_deduplicate = Some(f);
        self
    }

    fn deduplicated(&self, options: &LoadSubsetOptions) {
        debug_log!("subset load deduplicated: limit={:?}", options.limit);
        if let Some(f) = &self.on_deduplicate {
            f(options);
        }
    }

    /// Loads a subset, skipping the source when the data is already covered.
    pub fn load_subset(&self, options: &LoadSubsetOptions) -> LoadSubsetResult {
        let (covered, shared, forwarded) = {
            let tracking = self.tracking.borrow();
            let covered = tracking.is_covered(options);
            let shared = tracking
                .in_flight
                .iter()
                .find(|f| is_predicate_subset(options, &f.options))
                .map(|f| f.completion.clone());
            let mut forwarded = options.clone();
            if let (Some(loaded), None) = (&tracking.unlimited_where, options.limit) {
                if let Some(narrowed) = minus_where_predicates(options.where_expr.as_ref(), Some(loaded)) {
                    forwarded.where_expr = Some(narrowed);
                }
            }
            (covered, shared, forwarded)
        };

        if covered {
            self.deduplicated(options);
            return LoadSubsetResult::Loaded;
        }
        if let Some(completion) = shared {
            let this = self.clone();
            let options = options.clone();
            completion.on_settle(move |state| {
                if matches!(state, CompletionState::Resolved) {
                    this.deduplicated(&options);
                }
            });
            return LoadSubsetResult::Pending(completion);
        }

        match (self.loader)(&forwarded) {
            LoadSubsetResult::Loaded => {
                self.tracking.borrow_mut().record(&forwarded);
                LoadSubsetResult::Loaded
            }
            LoadSubsetResult::Pending(completion) => {
                let (id, generation) = {
                    let mut tracking = self.tracking.borrow_mut();
                    let id = tracking.next_id;
                    tracking.next_id += 1;
                    tracking.in_flight.push(InFlight {
                        id,
                        options: forwarded.clone(),
                        completion: completion.clone(),
                    });
                    (id, tracking.generation)
                };
                let weak: Weak<RefCell<Tracking>> = Rc::downgrade(&self.tracking);
                completion.on_settle(move |state| {
                    let Some(tracking) = weak.upgrade() else {
                        return;
                    };
                    let mut tracking = tracking.borrow_mut();
                    if matches!(state, CompletionState::Resolved) && tracking.generation == generation {
                        tracking.record(&forwarded);
                    }
                    tracking.in_flight.retain(|f| f.id != id);
                });
                LoadSubsetResult::Pending(completion)
            }
        }
    }

    /// Forgets all coverage. Used when the source truncates.
    pub fn reset(&self) {
        let mut tracking = self.tracking.borrow_mut();
        tracking.unlimited_where = None;
        tracking.has_loaded_all_data = false;
        tracking.limited_calls.clear();
        tracking.in_flight.clear();
        tracking.generation += 1;
    }

    /// Number of requests currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.tracking.borrow().in_flight.len()
    }

    /// True once an unlimited, unfiltered request has completed.
    pub fn has_loaded_all_data(&self) -> bool {
        self.tracking.borrow().has_loaded_all_data
    }
}
