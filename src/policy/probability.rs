use super::Policy;
use crate::codec::Config;
use crate::error::Error;
use crate::error::Result;
use crate::plan::tree::Tree;
use crate::retry;
use crate::retry::Sibling;
use crate::Probability;
use crate::P_OVERSHOOT_TOLERANCE;
use std::collections::BTreeMap;

impl<C: Config> Policy<C> {
    /// Re-derive every probability the counters feed.
    ///
    /// Three passes over the whole tree: effective edge probabilities from
    /// the root down, goal probabilities from the leaves up, then a marking
    /// pass that flags states which can only reach the goal by reversing
    /// onto their parent's branch. Updating everything is slower than
    /// updating the touched transition alone, but it cannot miss anything.
    pub(crate) fn propagate_probabilities(&mut self) -> Result<()> {
        self.propagate_effective(0)?;
        for index in (0..self.tree.len()).rev() {
            self.propagate_goal(index)?;
        }
        for index in 1..self.tree.len() {
            let parent = self
                .tree
                .parent(index)
                .expect("linkage holds: non-root states have parents");
            let parent_goal = self.tree.state(parent).goal_p();
            let current = self.tree.state(index);
            if current.goal_p() > 0.0 || parent_goal <= 0.0 {
                continue;
            }
            // the negative sign records "goal reachable only by reversing";
            // direct-reach accounting treats these as zero
            let reversal_only = -(parent_goal * current.reverse_edge_p());
            self.tree.state_mut(index).set_goal_p(reversal_only);
        }
        Ok(())
    }

    /// re-run the split retry recurrence for every transition group under
    /// `index`, then recurse into its children
    fn propagate_effective(&mut self, index: usize) -> Result<()> {
        let children = self.tree.children(index).to_vec();
        for group in group_by_transition(&self.tree, &children).values() {
            self.refresh_effective(group)?;
        }
        for child in children {
            self.propagate_effective(child)?;
        }
        Ok(())
    }

    fn refresh_effective(&mut self, group: &[usize]) -> Result<()> {
        for (slot, &index) in group.iter().enumerate() {
            let siblings = group
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != slot)
                .map(|(_, &sibling)| {
                    let state = self.tree.state(sibling);
                    Sibling {
                        raw_edge_p: state.raw_edge_p(),
                        reverse_edge_p: state.reverse_edge_p(),
                        independent: state.independent_outcomes(),
                    }
                })
                .collect::<Vec<_>>();
            let (reached, _) = retry::simulate(
                self.tree.state(index).raw_edge_p(),
                &siblings,
                self.edge_attempt_cap,
                None,
            );
            let reached = clamped(reached, "effective edge probability")?;
            self.tree.state_mut(index).set_effective_edge_p(reached);
        }
        Ok(())
    }

    /// a state's goal probability is that of its best transition; states
    /// with no children keep whatever they have (goal leaves stay goals)
    fn propagate_goal(&mut self, index: usize) -> Result<()> {
        let children = self.tree.children(index).to_vec();
        if children.is_empty() {
            return Ok(());
        }
        let mut best = f64::NEG_INFINITY;
        for group in group_by_transition(&self.tree, &children).values() {
            best = best.max(self.transition_goal_p(group)?);
        }
        let best = clamped(best, "transition goal probability")?;
        self.tree.state_mut(index).set_goal_p(best);
        Ok(())
    }

    /// The probability that commanding this transition eventually reaches
    /// the goal.
    ///
    /// A singleton transition is the plain product of its child's goal and
    /// effective edge probabilities. A split simulates retries: per chosen
    /// child, mass reaches the goal directly through that child, or gets
    /// stuck in a nominally-independent sibling that cannot reverse and
    /// reaches the goal from there. Independent children compete as
    /// alternative actions (max); dependent children are mutually exclusive
    /// outcomes of one action (sum).
    fn transition_goal_p(&self, group: &[usize]) -> Result<Probability> {
        match group {
            [] => Ok(0.0),
            [only] => {
                let child = self.tree.state(*only);
                Ok(child.goal_p() * child.effective_edge_p())
            }
            _ => {
                let mut dependent = 0.0;
                let mut independent: f64 = 0.0;
                for (slot, &index) in group.iter().enumerate() {
                    let chosen = self.tree.state(index);
                    let mut active = 1.0;
                    let mut direct = 0.0;
                    let mut stray = 0.0;
                    for _ in 0..self.edge_attempt_cap {
                        direct += active * chosen.raw_edge_p() * chosen.goal_p().max(0.0);
                        let mut returned = 0.0;
                        for (other_slot, &other_index) in group.iter().enumerate() {
                            if other_slot == slot {
                                continue;
                            }
                            let other = self.tree.state(other_index);
                            if !other.independent_outcomes() {
                                continue;
                            }
                            let reached_other = active * other.raw_edge_p();
                            stray += reached_other
                                * (1.0 - other.reverse_edge_p())
                                * other.goal_p().max(0.0);
                            returned += reached_other * other.reverse_edge_p();
                        }
                        active = returned;
                    }
                    let total = clamped(direct + stray, "split goal probability")?;
                    match chosen.independent_outcomes() {
                        true => independent = independent.max(total),
                        false => dependent += total,
                    }
                }
                clamped(independent + dependent, "transition goal probability")
            }
        }
    }
}

fn group_by_transition<C: Config>(tree: &Tree<C>, children: &[usize]) -> BTreeMap<u64, Vec<usize>> {
    let mut groups: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for &child in children {
        groups
            .entry(tree.state(child).transition_id())
            .or_default()
            .push(child);
    }
    groups
}

/// probabilities drift past 1.0 only by accumulated rounding; anything
/// beyond the tolerance is a broken invariant
fn clamped(p: f64, what: &str) -> Result<f64> {
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else if p > 1.0 && p <= 1.0 + P_OVERSHOOT_TOLERANCE {
        log::warn!("clamping {} ({}) to 1.0", what, p);
        Ok(1.0)
    } else {
        Err(Error::Internal(format!("{} ({}) out of range", what, p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::state::State;
    use crate::plan::tree::Tree;
    use crate::policy::Policy;
    use assert_approx_eq::assert_approx_eq;

    fn policy(tree: Tree<f64>) -> Policy<f64> {
        Policy::new(tree, 2.0, 1.0, 0.95, 10, 1).unwrap()
    }

    #[test]
    fn effective_probability_collapses_to_raw_without_splits() {
        let mut tree = Tree::new(State::planned(0, 0.0, 0.0, vec![0.0]));
        let middle = tree
            .attach(
                0,
                State::planned(1, 1.0, 1.0, vec![1.0])
                    .with_edge(0.8, 0.5, 1.0)
                    .with_counts(10, 8, 1, 1)
                    .with_transition(10, 11),
            )
            .unwrap();
        tree.attach(
            middle,
            State::planned(2, 2.0, 2.0, vec![2.0])
                .with_edge(1.0, 1.0, 1.0)
                .with_transition(20, 21)
                .with_goal(1.0),
        )
        .unwrap();
        let mut policy = policy(tree);
        policy.propagate_probabilities().unwrap();
        let tree = policy.tree().unwrap();
        assert_approx_eq!(tree.state(1).effective_edge_p(), 0.8);
        assert_approx_eq!(tree.state(2).effective_edge_p(), 1.0);
    }

    #[test]
    fn goal_probability_flows_from_the_leaves_to_the_root() {
        let mut tree = Tree::new(State::planned(0, 0.0, 0.0, vec![0.0]));
        let middle = tree
            .attach(
                0,
                State::planned(1, 1.0, 1.0, vec![1.0])
                    .with_edge(0.8, 0.8, 1.0)
                    .with_counts(10, 8, 1, 1)
                    .with_transition(10, 11),
            )
            .unwrap();
        tree.attach(
            middle,
            State::planned(2, 2.0, 2.0, vec![2.0])
                .with_edge(0.9, 0.9, 1.0)
                .with_counts(10, 9, 1, 1)
                .with_transition(20, 21)
                .with_goal(1.0),
        )
        .unwrap();
        let mut policy = policy(tree);
        policy.propagate_probabilities().unwrap();
        let tree = policy.tree().unwrap();
        assert_approx_eq!(tree.state(1).goal_p(), 0.9);
        assert_approx_eq!(tree.state(0).goal_p(), 0.9 * 0.8);
    }

    #[test]
    fn stranded_siblings_mark_goal_reach_as_reversal_only() {
        let mut tree = Tree::new(State::planned(0, 0.0, 0.0, vec![0.0]));
        let middle = tree
            .attach(
                0,
                State::planned(1, 1.0, 1.0, vec![1.0])
                    .with_edge(1.0, 1.0, 1.0)
                    .with_transition(10, 11)
                    .with_goal(1.0),
            )
            .unwrap();
        tree.attach(
            middle,
            State::planned(2, 2.0, 2.0, vec![2.0])
                .with_edge(1.0, 1.0, 1.0)
                .with_transition(20, 21)
                .with_goal(1.0),
        )
        .unwrap();
        tree.attach(
            middle,
            State::planned(3, 5.0, 5.0, vec![5.0])
                .with_edge(1.0, 1.0, 0.7)
                .with_counts(1, 1, 10, 7)
                .with_transition(30, 31),
        )
        .unwrap();
        let mut policy = policy(tree);
        policy.propagate_probabilities().unwrap();
        let tree = policy.tree().unwrap();
        assert!(tree.state(1).goal_p() > 0.0);
        assert_approx_eq!(tree.state(3).goal_p(), -(tree.state(1).goal_p() * 0.7));
    }

    #[test]
    fn split_goal_probability_maxes_independent_alternatives() {
        let mut tree = Tree::new(State::planned(0, 0.0, 0.0, vec![0.0]));
        tree.attach(
            0,
            State::planned(1, 1.0, 1.0, vec![1.0])
                .with_edge(0.6, 0.6, 1.0)
                .with_counts(10, 6, 1, 1)
                .with_transition(7, 8)
                .with_split(7, true)
                .with_goal(1.0),
        )
        .unwrap();
        tree.attach(
            0,
            State::planned(2, -1.0, -1.0, vec![-1.0])
                .with_edge(0.4, 0.4, 0.0)
                .with_counts(10, 4, 10, 0)
                .with_transition(7, 9)
                .with_split(7, true)
                .with_goal(0.5),
        )
        .unwrap();
        let mut policy = policy(tree);
        policy.propagate_probabilities().unwrap();
        let tree = policy.tree().unwrap();
        // aiming at child 1: only the first attempt can land there, since
        // nothing returns from the unreversible sibling; stuck mass still
        // reaches the goal from child 2 half the time
        let direct = 0.6;
        let stray = 0.4 * 0.5;
        assert_approx_eq!(tree.state(0).goal_p(), direct + stray);
    }

    #[test]
    fn irrecoverable_overshoot_is_an_internal_error() {
        let mut tree = Tree::new(State::planned(0, 0.0, 0.0, vec![0.0]));
        // an impossible pair of split outcomes whose raw probabilities sum
        // to well over one
        tree.attach(
            0,
            State::planned(1, 1.0, 1.0, vec![1.0])
                .with_edge(0.9, 0.9, 1.0)
                .with_counts(10, 9, 1, 1)
                .with_transition(7, 8)
                .with_split(7, true)
                .with_goal(1.0),
        )
        .unwrap();
        tree.attach(
            0,
            State::planned(2, -1.0, -1.0, vec![-1.0])
                .with_edge(0.9, 0.9, 1.0)
                .with_counts(10, 9, 1, 1)
                .with_transition(7, 9)
                .with_split(7, true)
                .with_goal(1.0),
        )
        .unwrap();
        let mut policy = policy(tree);
        assert!(matches!(
            policy.propagate_probabilities(),
            Err(Error::Internal(_))
        ));
    }
}
