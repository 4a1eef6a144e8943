use crate::codec::Config;
use crate::plan::state::State;
use crate::Cost;
use petgraph::graph::DiGraph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

/// The weighted policy graph.
///
/// Nodes mirror the planner tree slot for slot, in the same order, with one
/// extra node appended at the end: the synthetic goal sink, a trivial state
/// wrapping the raw goal configuration. Edge weights start out as raw
/// transition probabilities and are replaced by expected costs before the
/// shortest-path search runs.
#[derive(Debug, Clone)]
pub struct PolicyGraph<C: Config> {
    pub(crate) graph: DiGraph<State<C>, Cost>,
    pub(crate) sink: NodeIndex,
}

impl<C: Config> PolicyGraph<C> {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn sink_index(&self) -> usize {
        self.sink.index()
    }

    pub fn state(&self, index: usize) -> &State<C> {
        self.graph
            .node_weight(NodeIndex::new(index))
            .expect("valid node index")
    }

    pub fn graph(&self) -> &DiGraph<State<C>, Cost> {
        &self.graph
    }

    /// every edge as a `(from, to, weight)` triple, in insertion order
    pub fn edges(&self) -> Vec<(usize, usize, Cost)> {
        self.graph
            .edge_references()
            .map(|edge| (edge.source().index(), edge.target().index(), *edge.weight()))
            .collect()
    }

    /// every edge must connect two distinct in-range nodes with a
    /// well-defined weight
    pub fn check_linkage(&self) -> bool {
        self.graph
            .edge_references()
            .all(|edge| edge.source() != edge.target() && !edge.weight().is_nan())
    }
}

impl<C: Config> Default for PolicyGraph<C> {
    fn default() -> Self {
        Self {
            graph: DiGraph::default(),
            sink: NodeIndex::end(),
        }
    }
}
