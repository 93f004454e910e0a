//! Dataflow node definitions.

use crate::delta::{Delta, DeltaBatch};
use alloc::boxed::Box;
use alloc::vec::Vec;
use rill_core::Result;

/// Predicate for filtering items.
pub type PredicateFn<T> = Box<dyn Fn(&T) -> bool>;

/// Mapper function for transforming items.
pub type MapperFn<T> = Box<dyn Fn(T) -> T>;

/// Receives the deltas reaching an output node.
pub type OutputFn<T> = Box<dyn FnMut(&[Delta<T>])>;

/// A stateful operator stage.
///
/// `step` receives one batch per input port (possibly empty) and returns the
/// deltas to forward downstream. Implementations keep whatever state they need
/// to answer from new deltas alone.
pub trait Operator<T> {
    /// Returns the name of this operator, for diagnostics.
    fn name(&self) -> &'static str;

    /// Number of input ports.
    fn arity(&self) -> usize {
        1
    }

    /// True when the operator has output queued independently of new input.
    fn has_pending_output(&self) -> bool {
        false
    }

    /// Processes one batch per input port.
    fn step(&mut self, inputs: Vec<DeltaBatch<T>>) -> Result<DeltaBatch<T>>;
}

/// A node in the dataflow graph.
pub enum DataflowNode<T> {
    /// Entry point fed by `DataflowGraph::send`
    Input,

    /// Filter operation - passes through items matching predicate
    Filter { predicate: PredicateFn<T> },

    /// Map operation - transforms items
    Map { mapper: MapperFn<T> },

    /// Stateful operator such as a join or top-K
    Operator(Box<dyn Operator<T>>),

    /// Sink delivering deltas to a callback
    Output { callback: OutputFn<T> },
}

impl<T> DataflowNode<T> {
    /// Creates a filter node.
    pub fn filter<F>(predicate: F) -> Self
    where
        F: Fn(&T) -> bool + 'static,
    {
        DataflowNode::Filter {
            predicate: Box::new(predicate),
        }
    }

    /// Creates a map node.
    pub fn map<F>(mapper: F) -> Self
    where
        F: Fn(T) -> T + 'static,
    {
        DataflowNode::Map {
            mapper: Box::new(mapper),
        }
    }

    /// Creates an output node.
    pub fn output<F>(callback: F) -> Self
    where
        F: FnMut(&[Delta<T>]) + 'static,
    {
        DataflowNode::Output {
            callback: Box::new(callback),
        }
    }

    /// Number of inputs this node consumes.
    pub fn arity(&self) -> usize {
        match self {
            DataflowNode::Input => 0,
            DataflowNode::Operator(op) => op.arity(),
            _ => 1,
        }
    }

    /// Returns the name of this node type.
    pub fn name(&self) -> &'static str {
        match self {
            DataflowNode::Input => "input",
            DataflowNode::Filter { .. } => "filter",
            DataflowNode::Map { .. } => "map",
            DataflowNode::Operator(op) => op.name(),
            DataflowNode::Output { .. } => "output",
        }
    }

    /// Returns true if this node emits without receiving input.
    pub(crate) fn has_pending_output(&self) -> bool {
        match self {
            DataflowNode::Operator(op) => op.has_pending_output(),
            _ => false,
        }
    }

    /// Runs one step of this node over its queued input.
    pub(crate) fn process(&mut self, mut inputs: Vec<DeltaBatch<T>>) -> Result<DeltaBatch<T>> {
        Ok(match self {
            DataflowNode::Input => inputs.pop().unwrap_or_default(),
            DataflowNode::Filter { predicate } => {
                let batch = inputs.pop().unwrap_or_default();
                crate::operators::filter_incremental(batch, |item| predicate(item))
            }
            DataflowNode::Map { mapper } => {
                let batch = inputs.pop().unwrap_or_default();
                crate::operators::map_incremental(batch, |item| mapper(item))
            }
            DataflowNode::Operator(op) => op.step(inputs)?,
            DataflowNode::Output { callback } => {
                let batch = inputs.pop().unwrap_or_default();
                if !batch.is_empty() {
                    callback(&batch);
                }
                Vec::new()
            }
        })
    }
}
