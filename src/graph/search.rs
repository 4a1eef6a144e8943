use crate::codec::Config;
use crate::error::Error;
use crate::error::Result;
use crate::graph::graph::PolicyGraph;
use crate::Cost;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction::Incoming;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Shortest-path result over the policy graph.
///
/// `distance` is the expected cost of travelling from a node to the sink
/// along edge directions; `previous` is the next hop on that path. The sink
/// is its own previous hop at distance zero. Unreachable nodes keep an
/// infinite distance and no previous hop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Distances {
    previous: Vec<Option<usize>>,
    distance: Vec<Cost>,
}

impl Distances {
    pub fn len(&self) -> usize {
        self.distance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distance.is_empty()
    }

    pub fn previous(&self, index: usize) -> Option<usize> {
        self.previous[index]
    }

    pub fn distance(&self, index: usize) -> Cost {
        self.distance[index]
    }
}

/// frontier entry ordered so the cheapest node pops first; index breaks
/// ties to keep the search deterministic
#[derive(Debug, Clone, Copy, PartialEq)]
struct Visit {
    cost: Cost,
    node: usize,
}

impl Eq for Visit {}

impl PartialOrd for Visit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Visit {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Single-destination Dijkstra toward `sink`.
///
/// Relaxation walks incoming edges, so each settled node learns the cheapest
/// way of reaching the sink along edge directions. Infinite-cost edges are
/// linkage-only and never traversed. Every node the search reaches must end
/// up with a next hop; a reachable node without one means the graph lost
/// its connection to the sink.
pub fn distances<C: Config>(graph: &PolicyGraph<C>, sink: usize) -> Result<Distances> {
    let nodes = graph.len();
    if sink >= nodes {
        return Err(Error::InvalidInput(format!(
            "sink index ({}) out of range for a graph of {} nodes",
            sink, nodes
        )));
    }
    let mut previous = vec![None; nodes];
    let mut distance = vec![Cost::INFINITY; nodes];
    let mut frontier = BinaryHeap::new();
    previous[sink] = Some(sink);
    distance[sink] = 0.0;
    frontier.push(Visit {
        cost: 0.0,
        node: sink,
    });
    while let Some(Visit { cost, node }) = frontier.pop() {
        if cost > distance[node] {
            continue;
        }
        for edge in graph.graph().edges_directed(NodeIndex::new(node), Incoming) {
            let neighbor = edge.source().index();
            let weight = *edge.weight();
            if !weight.is_finite() {
                continue;
            }
            let through = cost + weight;
            if through < distance[neighbor] {
                distance[neighbor] = through;
                previous[neighbor] = Some(node);
                frontier.push(Visit {
                    cost: through,
                    node: neighbor,
                });
            }
        }
    }
    if (0..nodes).any(|index| distance[index].is_finite() && previous[index].is_none()) {
        return Err(Error::Internal(
            "graph is no longer connected to the sink".into(),
        ));
    }
    Ok(Distances { previous, distance })
}
