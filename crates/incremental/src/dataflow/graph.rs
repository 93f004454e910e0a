//! Dataflow graph management.

use crate::dataflow::node::{DataflowNode, Operator};
use crate::delta::{Delta, DeltaBatch};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use rill_core::{Error, Result};

/// Unique identifier for a node in the dataflow graph.
pub type NodeId = usize;

struct NodeSlot<T> {
    node: DataflowNode<T>,
    /// Queued deltas, one batch per input port.
    queues: Vec<DeltaBatch<T>>,
    /// Downstream `(node, port)` pairs fed by this node.
    dependents: Vec<(NodeId, usize)>,
}

/// A dataflow graph propagating deltas from inputs through operator stages.
///
/// The graph is built in two phases. While building, nodes may only consume
/// nodes created before them, so insertion order is a topological order.
/// `finalize` freezes the topology; afterwards deltas are queued with `send`
/// and pushed through every stage by `run`.
pub struct DataflowGraph<T> {
    nodes: Vec<NodeSlot<T>>,
    finalized: bool,
}

impl<T: Clone> Default for DataflowGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> DataflowGraph<T> {
    /// Creates a new empty dataflow graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            finalized: false,
        }
    }

    /// Adds a node consuming the given nodes, in port order.
    ///
    /// Returns the node ID assigned to this node.
    pub fn add_node(&mut self, node: DataflowNode<T>, inputs: &[NodeId]) -> Result<NodeId> {
        if self.finalized {
            return Err(Error::graph_state("cannot add nodes to a finalized graph"));
        }
        let id = self.nodes.len();
        let ports = node.arity();
        if inputs.len() != ports {
            return Err(Error::graph_state(alloc::format!(
                "{} expects {} inputs, got {}",
                node.name(),
                ports,
                inputs.len()
            )));
        }
        for (port, &input) in inputs.iter().enumerate() {
            let upstream = self
                .nodes
                .get_mut(input)
                .ok_or_else(|| Error::graph_state(alloc::format!("unknown node {}", input)))?;
            if matches!(upstream.node, DataflowNode::Output { .. }) {
                return Err(Error::graph_state("output nodes cannot feed other nodes"));
            }
            upstream.dependents.push((id, port));
        }
        // Inputs get a single queue for `send`.
        let queues = (0..ports.max(1)).map(|_| Vec::new()).collect();
        self.nodes.push(NodeSlot {
            node,
            queues,
            dependents: Vec::new(),
        });
        Ok(id)
    }

    /// Adds an input node.
    pub fn add_input(&mut self) -> Result<NodeId> {
        self.add_node(DataflowNode::Input, &[])
    }

    /// Adds a filter stage.
    pub fn filter<F>(&mut self, input: NodeId, predicate: F) -> Result<NodeId>
    where
        F: Fn(&T) -> bool + 'static,
    {
        self.add_node(DataflowNode::filter(predicate), &[input])
    }

    /// Adds a map stage.
    pub fn map<F>(&mut self, input: NodeId, mapper: F) -> Result<NodeId>
    where
        F: Fn(T) -> T + 'static,
    {
        self.add_node(DataflowNode::map(mapper), &[input])
    }

    /// Adds a stateful operator stage.
    pub fn add_operator<O>(&mut self, operator: O, inputs: &[NodeId]) -> Result<NodeId>
    where
        O: Operator<T> + 'static,
    {
        self.add_node(DataflowNode::Operator(Box::new(operator)), inputs)
    }

    /// Adds an output sink.
    pub fn output<F>(&mut self, input: NodeId, callback: F) -> Result<NodeId>
    where
        F: FnMut(&[Delta<T>]) + 'static,
    {
        self.add_node(DataflowNode::output(callback), &[input])
    }

    /// Freezes the topology. Finalizing twice is a no-op.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Queues deltas on an input node. They are processed by the next `run`.
    pub fn send(&mut self, input: NodeId, batch: DeltaBatch<T>) -> Result<()> {
        if !self.finalized {
            return Err(Error::graph_state("graph must be finalized before sending data"));
        }
        let slot = self
            .nodes
            .get_mut(input)
            .ok_or_else(|| Error::graph_state(alloc::format!("unknown node {}", input)))?;
        if !matches!(slot.node, DataflowNode::Input) {
            return Err(Error::graph_state(alloc::format!(
                "node {} is not an input",
                input
            )));
        }
        slot.queues[0].extend(batch);
        Ok(())
    }

    /// True when any node has queued work.
    pub fn has_pending(&self) -> bool {
        self.nodes
            .iter()
            .any(|slot| slot.node.has_pending_output() || slot.queues.iter().any(|q| !q.is_empty()))
    }

    /// Propagates all queued deltas through the graph.
    ///
    /// Each node runs at most once, in insertion order, after all of its
    /// upstream nodes. Nodes without queued input are skipped, so running an
    /// idle graph emits nothing.
    pub fn run(&mut self) -> Result<()> {
        if !self.finalized {
            return Err(Error::graph_state("graph must be finalized before running"));
        }
        for id in 0..self.nodes.len() {
            let slot = &mut self.nodes[id];
            let idle = slot.queues.iter().all(|q| q.is_empty());
            if idle && !slot.node.has_pending_output() {
                continue;
            }
            let ports = slot.queues.len();
            let inputs = core::mem::replace(&mut slot.queues, vec![Vec::new(); ports]);
            let output = slot.node.process(inputs)?;
            if output.is_empty() {
                continue;
            }
            let dependents = slot.dependents.clone();
            for (dependent, port) in dependents {
                self.nodes[dependent].queues[port].extend(output.iter().cloned());
            }
        }
        Ok(())
    }

    /// Returns the number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    fn collector<T: Clone + 'static>() -> (Rc<RefCell<Vec<Delta<T>>>>, impl FnMut(&[Delta<T>])) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |batch: &[Delta<T>]| sink.borrow_mut().extend_from_slice(batch))
    }

    #[test]
    fn test_filter_map_pipeline() {
        let mut graph = DataflowGraph::new();
        let input = graph.add_input().unwrap();
        let evens = graph.filter(input, |x: &i32| x % 2 == 0).unwrap();
        let scaled = graph.map(evens, |x| x * 10).unwrap();
        let (seen, sink) = collector();
        graph.output(scaled, sink).unwrap();
        graph.finalize();

        graph
            .send(input, vec![Delta::insert(1), Delta::insert(2), Delta::delete(4)])
            .unwrap();
        graph.run().unwrap();
        assert_eq!(*seen.borrow(), vec![Delta::insert(20), Delta::delete(40)]);
    }

    #[test]
    fn test_default_graph_is_empty_and_open() {
        let mut graph: DataflowGraph<i32> = DataflowGraph::default();
        assert!(graph.is_empty());
        assert!(!graph.is_finalized());
        graph.add_input().unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_rerun_without_input_is_noop() {
        let mut graph = DataflowGraph::new();
        let input = graph.add_input().unwrap();
        let (seen, sink) = collector();
        graph.output(input, sink).unwrap();
        graph.finalize();

        graph.send(input, vec![Delta::insert(1)]).unwrap();
        graph.run().unwrap();
        graph.run().unwrap();
        graph.run().unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert!(!graph.has_pending());
    }

    #[test]
    fn test_fan_out() {
        let mut graph = DataflowGraph::new();
        let input = graph.add_input().unwrap();
        let (left, left_sink) = collector();
        let (right, right_sink) = collector();
        graph.output(input, left_sink).unwrap();
        let negated = graph.map(input, |x: i32| -x).unwrap();
        graph.output(negated, right_sink).unwrap();
        graph.finalize();

        graph.send(input, vec![Delta::insert(5)]).unwrap();
        graph.run().unwrap();
        assert_eq!(*left.borrow(), vec![Delta::insert(5)]);
        assert_eq!(*right.borrow(), vec![Delta::insert(-5)]);
    }

    #[test]
    fn test_phase_errors() {
        let mut graph: DataflowGraph<i32> = DataflowGraph::new();
        let input = graph.add_input().unwrap();
        assert!(graph.send(input, vec![Delta::insert(1)]).is_err());
        assert!(graph.run().is_err());

        graph.finalize();
        assert!(graph.add_input().is_err());
        assert!(graph.send(99, Vec::new()).is_err());
    }

    #[test]
    fn test_wiring_errors() {
        let mut graph: DataflowGraph<i32> = DataflowGraph::new();
        assert!(graph.filter(3, |_| true).is_err());
        let input = graph.add_input().unwrap();
        let sink = graph.output(input, |_| {}).unwrap();
        assert!(graph.map(sink, |x| x).is_err());
        assert!(graph.add_node(DataflowNode::map(|x| x), &[]).is_err());
    }
}
