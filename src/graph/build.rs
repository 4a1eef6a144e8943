use crate::codec::Config;
use crate::error::Error;
use crate::error::Result;
use crate::graph::graph::PolicyGraph;
use crate::plan::state::State;
use crate::plan::tree::Tree;
use crate::retry;
use crate::retry::Sibling;
use petgraph::graph::DiGraph;
use petgraph::graph::EdgeIndex;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

/// Build the raw policy graph from a planner tree.
///
/// Nodes are allocated in tree order, the goal sink last. Every non-root
/// state gets an edge back to its parent weighted by its reverse edge
/// probability, every child gets an edge from its parent weighted by the
/// child's effective edge probability, and every childless state with a
/// positive goal probability is tied to the sink in both directions.
pub fn build<C: Config>(tree: &Tree<C>, goal_state: State<C>) -> Result<PolicyGraph<C>> {
    if tree.is_empty() {
        return Err(Error::InvalidInput(
            "cannot build a policy graph from an empty planner tree".into(),
        ));
    }
    if !tree.check_linkage() {
        return Err(Error::InvalidInput(
            "planner tree has invalid linkage".into(),
        ));
    }
    let mut graph = DiGraph::with_capacity(tree.len() + 1, 2 * tree.len());
    for slot in tree.slots() {
        graph.add_node(slot.state().clone());
    }
    let sink = graph.add_node(goal_state);
    for index in 0..tree.len() {
        let node = NodeIndex::new(index);
        if let Some(parent) = tree.parent(index) {
            let weight = tree.state(index).reverse_edge_p();
            graph.add_edge(node, NodeIndex::new(parent), weight);
        }
        for &child in tree.children(index) {
            let weight = tree.state(child).effective_edge_p();
            graph.add_edge(node, NodeIndex::new(child), weight);
        }
        if tree.children(index).is_empty() && tree.state(index).goal_p() > 0.0 {
            let weight = tree.state(index).goal_p();
            graph.add_edge(node, sink, weight);
            graph.add_edge(sink, node, weight);
        }
    }
    let graph = PolicyGraph { graph, sink };
    if !graph.check_linkage() {
        return Err(Error::Internal(
            "generated policy graph has invalid linkage".into(),
        ));
    }
    Ok(graph)
}

/// Estimate how many times an edge must be commanded.
///
/// Forward edges aimed at a split child may need retries: every attempt,
/// mass landing in a nominally-independent sibling can reverse back to the
/// parent and try again. The estimate is the attempt count at which the
/// cumulative probability of landing in the desired child reaches the
/// conformant threshold, capped at `edge_attempt_cap`. Reverse edges carry
/// no retry model and estimate a single attempt.
pub fn estimate_attempts<C: Config>(
    graph: &PolicyGraph<C>,
    from: usize,
    to: usize,
    conformant_threshold: f64,
    edge_attempt_cap: u32,
) -> Result<u32> {
    if from >= graph.len() {
        return Err(Error::InvalidInput(format!("from index ({}) out of range", from)));
    }
    if to >= graph.len() {
        return Err(Error::InvalidInput(format!("to index ({}) out of range", to)));
    }
    if from == to {
        return Err(Error::InvalidInput(
            "from and to cannot be the same node".into(),
        ));
    }
    if from > to {
        return Ok(1);
    }
    let target = graph.state(to);
    let siblings = graph
        .graph()
        .edges(NodeIndex::new(from))
        .map(|edge| graph.state(edge.target().index()))
        .filter(|other| {
            other.transition_id() == target.transition_id()
                && other.state_id() != target.state_id()
        })
        .map(|other| Sibling {
            raw_edge_p: other.raw_edge_p(),
            reverse_edge_p: other.reverse_edge_p(),
            independent: other.independent_outcomes(),
        })
        .collect::<Vec<_>>();
    if siblings.is_empty() {
        return Ok(1);
    }
    let (_, attempts) = retry::simulate(
        target.raw_edge_p(),
        &siblings,
        edge_attempt_cap,
        Some(conformant_threshold),
    );
    Ok(attempts)
}

/// Replace every edge probability with an expected cost.
///
/// A positive-probability edge costs `(1 / p) * marginal_edge_weight *
/// estimated_attempts`; probabilities below machine epsilon invert to
/// infinity rather than blowing up. Zero-probability edges are kept for
/// linkage but priced out of the search at infinite cost.
pub fn weighten<C: Config>(
    mut graph: PolicyGraph<C>,
    marginal_edge_weight: f64,
    conformant_threshold: f64,
    edge_attempt_cap: u32,
) -> Result<PolicyGraph<C>> {
    let edges = graph.graph.edge_indices().collect::<Vec<EdgeIndex>>();
    for edge in edges {
        let (from, to) = graph
            .graph
            .edge_endpoints(edge)
            .expect("edge ids enumerated from this graph");
        let p = *graph
            .graph
            .edge_weight(edge)
            .expect("edge ids enumerated from this graph");
        let cost = if p > 0.0 {
            let attempts = estimate_attempts(
                &graph,
                from.index(),
                to.index(),
                conformant_threshold,
                edge_attempt_cap,
            )?;
            let inversion = if p >= f64::EPSILON { 1.0 / p } else { f64::INFINITY };
            inversion * marginal_edge_weight * f64::from(attempts)
        } else {
            f64::INFINITY
        };
        *graph
            .graph
            .edge_weight_mut(edge)
            .expect("edge ids enumerated from this graph") = cost;
    }
    Ok(graph)
}
