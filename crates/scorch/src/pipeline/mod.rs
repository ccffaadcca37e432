//! Pipeline graph model: stage anchors, component nodes and weighted edges
//! for one (experiment, run, loop) slot.

mod graph;

pub use graph::{
    Edge, Node, NodeKind, NodeStatus, Pipeline, CONFIRMED, DONE_NODE, LOOP_NODE, PROVISIONAL,
};
