//! Single-threaded completion handles.
//!
//! A `Completion` is the confirmation signal of an asynchronous piece of work
//! (a mutation handler, a subset load). Its state can be consulted synchronously
//! at any time, and callbacks can be attached to run once it settles.

use crate::error::Error;
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

/// Observable state of a completion.
#[derive(Clone, Debug, PartialEq)]
pub enum CompletionState {
    Pending,
    Resolved,
    Rejected(Error),
}

type SettleCallback = Box<dyn FnOnce(&CompletionState)>;

struct Inner {
    state: RefCell<CompletionState>,
    callbacks: RefCell<Vec<SettleCallback>>,
}

/// Shared handle to a unit of asynchronous work.
///
/// Cloning shares the same underlying state.
#[derive(Clone)]
pub struct Completion {
    inner: Rc<Inner>,
}

impl Completion {
    /// Creates a pending completion.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(CompletionState::Pending),
                callbacks: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Creates an already resolved completion.
    pub fn resolved() -> Self {
        let c = Self::new();
        c.resolve();
        c
    }

    /// Creates an already rejected completion.
    pub fn rejected(error: Error) -> Self {
        let c = Self::new();
        c.reject(error);
        c
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> CompletionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.state.borrow(), CompletionState::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.inner.state.borrow(), CompletionState::Resolved)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.inner.state.borrow(), CompletionState::Rejected(_))
    }

    /// Returns true if both handles share the same state.
    pub fn ptr_eq(&self, other: &Completion) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves the completion. Settling twice is a no-op.
    pub fn resolve(&self) {
        self.settle(CompletionState::Resolved);
    }

    /// Rejects the completion with an error. Settling twice is a no-op.
    pub fn reject(&self, error: Error) {
        self.settle(CompletionState::Rejected(error));
    }

    /// Registers a callback to run once settled.
    ///
    /// Runs immediately when the completion has already settled.
    pub fn on_settle<F>(&self, callback: F)
    where
        F: FnOnce(&CompletionState) + 'static,
    {
        let state = self.state();
        if state == CompletionState::Pending {
            self.inner.callbacks.borrow_mut().push(Box::new(callback));
        } else {
            callback(&state);
        }
    }

    /// Returns a completion that resolves once every input resolves, or rejects
    /// with the first rejection.
    pub fn all(completions: Vec<Completion>) -> Completion {
        let combined = Completion::new();
        let remaining = Rc::new(Cell::new(completions.len()));
        if completions.is_empty() {
            combined.resolve();
            return combined;
        }
        for completion in completions {
            let combined = combined.clone();
            let remaining = remaining.clone();
            completion.on_settle(move |state| match state {
                CompletionState::Rejected(err) => combined.reject(err.clone()),
                _ => {
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        combined.resolve();
                    }
                }
            });
        }
        combined
    }

    fn settle(&self, next: CompletionState) {
        {
            let mut state = self.inner.state.borrow_mut();
            if *state != CompletionState::Pending {
                return;
            }
            *state = next.clone();
        }
        // Callbacks may register new callbacks or settle other completions.
        let callbacks = core::mem::take(&mut *self.inner.callbacks.borrow_mut());
        for callback in callbacks {
            callback(&next);
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Completion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Completion").field("state", &self.state()).finish()
    }
}
