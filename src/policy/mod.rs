pub mod action;
mod probability;
mod query;

pub use action::Action;

use crate::codec;
use crate::codec::Config;
use crate::error::Error;
use crate::error::Result;
use crate::graph::build;
use crate::graph::search;
use crate::graph::Distances;
use crate::graph::PolicyGraph;
use crate::plan::state::State;
use crate::plan::tree::Tree;

/// An executable policy over a probabilistic planner tree.
///
/// The policy owns the tree it was planned from, plus two structures derived
/// from it on every rebuild: the weighted policy graph and the
/// shortest-path result sourced at the synthetic goal sink. Queries match
/// the observed configuration against the tree, fold observations back into
/// its counters, and read the next action off the shortest-path result.
///
/// A default-constructed policy is uninitialized; every accessor and query
/// on it fails until a real policy is built or decoded.
#[derive(Debug, Clone)]
pub struct Policy<C: Config> {
    initialized: bool,
    tree: Tree<C>,
    goal: Option<C>,
    marginal_edge_weight: f64,
    conformant_threshold: f64,
    edge_attempt_cap: u32,
    policy_action_attempt_count: u32,
    graph: PolicyGraph<C>,
    distances: Distances,
}

impl<C: Config> Default for Policy<C> {
    fn default() -> Self {
        Self {
            initialized: false,
            tree: Tree::default(),
            goal: None,
            marginal_edge_weight: 0.0,
            conformant_threshold: 0.0,
            edge_attempt_cap: 0,
            policy_action_attempt_count: 0,
            graph: PolicyGraph::default(),
            distances: Distances::default(),
        }
    }
}

impl<C: Config> Policy<C> {
    pub fn new(
        tree: Tree<C>,
        goal: C,
        marginal_edge_weight: f64,
        conformant_threshold: f64,
        edge_attempt_cap: u32,
        policy_action_attempt_count: u32,
    ) -> Result<Self> {
        let mut policy = Self {
            initialized: true,
            tree,
            goal: Some(goal),
            marginal_edge_weight,
            conformant_threshold,
            edge_attempt_cap,
            policy_action_attempt_count,
            graph: PolicyGraph::default(),
            distances: Distances::default(),
        };
        policy.rebuild()?;
        Ok(policy)
    }

    /// Derive the weighted graph and shortest-path result from the tree.
    ///
    /// Runs at construction, after decoding, and after every tree mutation;
    /// the derived structures are always rebuilt whole.
    pub fn rebuild(&mut self) -> Result<()> {
        let goal = self.goal.clone().ok_or(Error::NotInitialized)?;
        let graph = build::build(&self.tree, State::anchor(goal))?;
        let graph = build::weighten(
            graph,
            self.marginal_edge_weight,
            self.conformant_threshold,
            self.edge_attempt_cap,
        )?;
        let distances = search::distances(&graph, graph.sink_index())?;
        self.graph = graph;
        self.distances = distances;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn ready(&self) -> Result<()> {
        match self.initialized {
            true => Ok(()),
            false => Err(Error::NotInitialized),
        }
    }

    pub fn tree(&self) -> Result<&Tree<C>> {
        self.ready()?;
        Ok(&self.tree)
    }

    pub fn goal(&self) -> Result<&C> {
        self.ready()?;
        self.goal.as_ref().ok_or(Error::NotInitialized)
    }

    pub fn graph(&self) -> Result<&PolicyGraph<C>> {
        self.ready()?;
        Ok(&self.graph)
    }

    pub fn distances(&self) -> Result<&Distances> {
        self.ready()?;
        Ok(&self.distances)
    }

    pub fn marginal_edge_weight(&self) -> Result<f64> {
        self.ready()?;
        Ok(self.marginal_edge_weight)
    }

    pub fn conformant_threshold(&self) -> Result<f64> {
        self.ready()?;
        Ok(self.conformant_threshold)
    }

    pub fn edge_attempt_cap(&self) -> Result<u32> {
        self.ready()?;
        Ok(self.edge_attempt_cap)
    }

    pub fn policy_action_attempt_count(&self) -> Result<u32> {
        self.ready()?;
        Ok(self.policy_action_attempt_count)
    }

    /// how many attempts each commanded policy action is worth when folding
    /// observations into the counters
    pub fn set_policy_action_attempt_count(&mut self, count: u32) {
        self.policy_action_attempt_count = count;
    }

    /// Append the policy to `buf`, returning the bytes written.
    ///
    /// The derived graph and shortest-path result are not persisted; they
    /// are rebuilt after decoding.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<u64> {
        self.ready()?;
        let goal = self.goal.as_ref().ok_or(Error::NotInitialized)?;
        let mut written = codec::put_u8(buf, 1);
        written += self.tree.encode(buf);
        written += goal.encode(buf);
        written += codec::put_f64(buf, self.marginal_edge_weight);
        written += codec::put_f64(buf, self.conformant_threshold);
        written += codec::put_u32(buf, self.edge_attempt_cap);
        written += codec::put_u32(buf, self.policy_action_attempt_count);
        Ok(written)
    }

    /// Decode a policy starting at `at`, returning it with the bytes
    /// consumed. The graph and shortest-path result are rebuilt immediately.
    pub fn deserialize(buf: &[u8], at: u64) -> Result<(Self, u64)> {
        let mut consumed = 0;
        let (flag, read) = codec::get_u8(buf, at + consumed)?;
        consumed += read;
        if flag != 1 {
            return Err(Error::Malformed(format!(
                "initialized flag must be 1, got {}",
                flag
            )));
        }
        let (tree, read) = Tree::decode(buf, at + consumed)?;
        consumed += read;
        let (goal, read) = C::decode(buf, at + consumed)?;
        consumed += read;
        let (marginal_edge_weight, read) = codec::get_f64(buf, at + consumed)?;
        consumed += read;
        let (conformant_threshold, read) = codec::get_f64(buf, at + consumed)?;
        consumed += read;
        let (edge_attempt_cap, read) = codec::get_u32(buf, at + consumed)?;
        consumed += read;
        let (policy_action_attempt_count, read) = codec::get_u32(buf, at + consumed)?;
        consumed += read;
        let mut policy = Self {
            initialized: true,
            tree,
            goal: Some(goal),
            marginal_edge_weight,
            conformant_threshold,
            edge_attempt_cap,
            policy_action_attempt_count,
            graph: PolicyGraph::default(),
            distances: Distances::default(),
        };
        policy.rebuild()?;
        Ok((policy, consumed))
    }

    /// Render the policy tree as nested `<state>` blocks, two spaces of
    /// indentation per level, with `printer` supplying the lines for each
    /// state's value.
    pub fn print_human_readable(
        &self,
        printer: impl Fn(&State<C>) -> Vec<String>,
    ) -> Result<String> {
        self.ready()?;
        if self.tree.is_empty() {
            return Err(Error::InvalidInput("policy tree is empty".into()));
        }
        Ok(self.render_state(0, &printer).join("\n"))
    }

    fn render_state(
        &self,
        index: usize,
        printer: &impl Fn(&State<C>) -> Vec<String>,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!("<state id=\"{}\">", self.tree.state(index).state_id()));
        lines.push("  <value>".into());
        for line in printer(self.tree.state(index)) {
            lines.push(format!("    {}", line));
        }
        lines.push("  </value>".into());
        lines.push("  <children>".into());
        for &child in self.tree.children(index) {
            for line in self.render_state(child, printer) {
                lines.push(format!("    {}", line));
            }
        }
        lines.push("  </children>".into());
        lines.push("</state>".into());
        lines
    }

    /// Diagnostic dump of the tree with its probabilities, next hops, and
    /// distances to the sink.
    pub fn print_tree(&self) -> Result<String> {
        self.ready()?;
        let mut out = format!("planner tree with {} states:", self.tree.len());
        for index in 0..self.tree.len() {
            let state = self.tree.state(index);
            let parent = self.tree.parent(index).map_or(-1, |p| p as i64);
            out.push_str(&format!(
                "\nstate {} with P({}->{}) = {}/{} [raw/effective] and P({}->{}) = {} and P(->goal) = {} and previous = ",
                index,
                parent,
                index,
                state.raw_edge_p(),
                state.effective_edge_p(),
                index,
                parent,
                state.reverse_edge_p(),
                state.goal_p(),
            ));
            match self.distances.previous(index) {
                Some(hop) if hop == self.graph.sink_index() => {
                    out.push_str(&format!("(goal) with distance = {}", self.distances.distance(index)));
                }
                Some(hop) => {
                    out.push_str(&format!("{} with distance = {}", hop, self.distances.distance(index)));
                }
                None => out.push_str("(none)"),
            }
        }
        Ok(out)
    }
}

impl<C: Config> std::fmt::Display for Policy<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.initialized {
            return write!(f, "execution policy (uninitialized)");
        }
        write!(f, "execution policy:")?;
        for (index, slot) in self.tree.slots().iter().enumerate() {
            write!(
                f,
                "\nstate #{} with parent {} and children {:?} - value: {}",
                index,
                slot.parent().map_or(-1, |p| p as i64),
                slot.children(),
                slot.state(),
            )?;
        }
        Ok(())
    }
}
