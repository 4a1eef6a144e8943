use super::Policy;
use crate::codec::Config;
use crate::error::Error;
use crate::error::Result;
use crate::plan::state::State;
use crate::plan::tree::Tree;
use crate::policy::action::Action;
use crate::Cost;
use crate::TransitionId;
use crate::RUNTIME_STATE_ID_FLOOR;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// An expected way the performed transition could have resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// landed in the state at this index
    Forward(usize),
    /// reversed out of the state at this index, back to its parent
    Reverse(usize),
}

impl Outcome {
    /// the tree index the robot occupies if this outcome happened
    fn resolved<C: Config>(self, tree: &Tree<C>) -> usize {
        match self {
            Self::Forward(index) => index,
            Self::Reverse(index) => tree
                .parent(index)
                .expect("reversals out of the root are unreachable"),
        }
    }
}

/// order candidates by expected cost to goal, index breaking ties so every
/// reduction is deterministic
fn closer(a: &(usize, Cost), b: &(usize, Cost)) -> Ordering {
    a.1
        .partial_cmp(&b.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(&b.0))
}

impl<C: Config> Policy<C> {
    /// Decide the next action given the observed outcome of the previously
    /// commanded transition.
    ///
    /// A performed transition id of zero is the cold start: the observed
    /// configuration is matched against the whole policy. Otherwise the
    /// observation is matched against the expected results of that
    /// transition, the matched state's counters absorb the observation, and
    /// the policy re-derives its graph before choosing the next action.
    ///
    /// The cluster predicate is invoked from parallel scans and must be
    /// pure and safe to call concurrently.
    pub fn query_best_action<F>(
        &mut self,
        performed_transition_id: TransitionId,
        current_config: &C,
        allow_branch_jumping: bool,
        link_runtime_states_to_planned_parent: bool,
        predicate: F,
    ) -> Result<Action<C>>
    where
        F: Fn(&[C], &C) -> bool + Sync,
    {
        self.ready()?;
        match performed_transition_id {
            0 => self.query_cold_start(current_config, &predicate),
            _ => self.query_normal(
                performed_transition_id,
                current_config,
                allow_branch_jumping,
                link_runtime_states_to_planned_parent,
                &predicate,
            ),
        }
    }

    /// scan every state in parallel for cluster membership, keeping the
    /// match closest to the goal
    fn best_matching_state<F>(&self, current_config: &C, predicate: &F) -> Option<usize>
    where
        F: Fn(&[C], &C) -> bool + Sync,
    {
        (0..self.tree.len())
            .into_par_iter()
            .filter(|&index| predicate(self.tree.state(index).particles(), current_config))
            .map(|index| (index, self.distances.distance(index)))
            .filter(|(_, distance)| distance.is_finite())
            .min_by(closer)
            .map(|(index, _)| index)
    }

    fn query_cold_start<F>(&self, current_config: &C, predicate: &F) -> Result<Action<C>>
    where
        F: Fn(&[C], &C) -> bool + Sync,
    {
        match self.best_matching_state(current_config, predicate) {
            Some(best) => {
                log::info!("starting configuration best matches state ({})", best);
                self.next_action(best)
            }
            None => Err(Error::NotCovered),
        }
    }

    fn query_normal<F>(
        &mut self,
        performed_transition_id: TransitionId,
        current_config: &C,
        allow_branch_jumping: bool,
        link_runtime_states_to_planned_parent: bool,
        predicate: &F,
    ) -> Result<Action<C>>
    where
        F: Fn(&[C], &C) -> bool + Sync,
    {
        log::info!(
            "querying the policy with performed transition ({})",
            performed_transition_id
        );
        let mut possibles = self.harvest(performed_transition_id)?;
        let previous = self.choose_previous(&possibles)?;
        let expected = possibles
            .remove(&previous)
            .expect("previous index chosen from these keys");
        log::info!("result state could match ({}) states", expected.len());
        let matches = expected
            .iter()
            .copied()
            .filter(|outcome| {
                let occupied = outcome.resolved(&self.tree);
                predicate(self.tree.state(occupied).particles(), current_config)
            })
            .collect::<Vec<_>>();
        if !matches.is_empty() {
            let chosen = self.update_counts_and_pick(&expected, &matches)?;
            self.rebuild()?;
            return self.next_action(chosen);
        }
        // no expected result matched; the observation may still sit one
        // tier down, but learning does not cross the parent/child boundary
        log::info!(
            "result state matched none of the ({}) expected results, checking their children",
            expected.len()
        );
        let children = expected
            .iter()
            .flat_map(|outcome| self.tree.children(outcome.resolved(&self.tree)))
            .copied()
            .collect::<Vec<_>>();
        let child_matches = children
            .iter()
            .copied()
            .filter(|&child| predicate(self.tree.state(child).particles(), current_config))
            .collect::<Vec<_>>();
        if !child_matches.is_empty() {
            let (best, _) = child_matches
                .into_iter()
                .map(|child| (child, self.distances.distance(child)))
                .filter(|(_, distance)| distance.is_finite())
                .min_by(closer)
                .ok_or_else(|| Error::Internal("could not identify best result state".into()))?;
            log::info!("selected best matching result child state ({})", best);
            return self.next_action(best);
        }
        if allow_branch_jumping {
            // robust error handling with fewer recovery steps, but only as
            // precise as the caller's clustering
            log::debug!("no expected result or child matched, trying to jump branches");
            if let Some(best) = self.best_matching_state(current_config, predicate) {
                log::info!("branch jump found a best-matching state ({})", best);
                return self.next_action(best);
            }
            log::debug!("branch jumping failed to find a matching state");
        }
        log::info!(
            "observation matched nothing near transition ({}), adding a new state",
            performed_transition_id
        );
        self.learn_state(
            previous,
            &expected,
            performed_transition_id,
            current_config,
            link_runtime_states_to_planned_parent,
        )?;
        self.rebuild()?;
        // the recursion is guaranteed to match the state just added
        self.query_normal(
            performed_transition_id,
            current_config,
            allow_branch_jumping,
            link_runtime_states_to_planned_parent,
            predicate,
        )
    }

    /// collect every state the performed transition could have produced,
    /// bucketed by the state the robot would have acted from
    fn harvest(
        &self,
        performed_transition_id: TransitionId,
    ) -> Result<BTreeMap<usize, Vec<Outcome>>> {
        let mut possibles: BTreeMap<usize, Vec<Outcome>> = BTreeMap::new();
        for index in 0..self.tree.len() {
            let state = self.tree.state(index);
            if state.transition_id() == performed_transition_id {
                let parent = self.tree.parent(index).ok_or_else(|| {
                    Error::Internal("a forward outcome cannot be the tree root".into())
                })?;
                possibles.entry(parent).or_default().push(Outcome::Forward(index));
            } else if state.reverse_transition_id() == performed_transition_id {
                possibles.entry(index).or_default().push(Outcome::Reverse(index));
            }
        }
        Ok(possibles)
    }

    /// pick the state the robot acted from; planned states win over
    /// runtime-learned ones, smallest index breaking any remaining tie
    fn choose_previous(&self, possibles: &BTreeMap<usize, Vec<Outcome>>) -> Result<usize> {
        let smallest = possibles.keys().copied().next().ok_or_else(|| {
            Error::Internal("performed transition matches no state in the tree".into())
        })?;
        if possibles.len() == 1 {
            return Ok(smallest);
        }
        log::warn!(
            "multiple previous state candidates {:?}",
            possibles.keys().collect::<Vec<_>>()
        );
        let chosen = possibles
            .keys()
            .copied()
            .find(|&index| self.tree.state(index).is_planned())
            .unwrap_or(smallest);
        log::info!("selected ({}) as the previous state index", chosen);
        Ok(chosen)
    }

    /// Fold the observation into the counters of every possible result and
    /// return the index of the state the robot is taken to occupy.
    fn update_counts_and_pick(
        &mut self,
        possibles: &[Outcome],
        matches: &[Outcome],
    ) -> Result<usize> {
        let worth = self.policy_action_attempt_count;
        if let (1, Some(&only)) = (possibles.len(), matches.first()) {
            log::info!("result state matched the single expected result");
            return Ok(match only {
                Outcome::Forward(index) => {
                    self.tree.state_mut(index).record_attempt(worth, worth);
                    index
                }
                Outcome::Reverse(index) => {
                    self.tree.state_mut(index).record_reverse_attempt(worth, worth);
                    only.resolved(&self.tree)
                }
            });
        }
        log::info!(
            "result state matched ({}) of ({}) expected results",
            matches.len(),
            possibles.len()
        );
        let best = matches
            .iter()
            .copied()
            .map(|outcome| (outcome, self.distances.distance(outcome.resolved(&self.tree))))
            .filter(|(_, distance)| distance.is_finite())
            .min_by(|a, b| closer(&(a.0.resolved(&self.tree), a.1), &(b.0.resolved(&self.tree), b.1)))
            .map(|(outcome, _)| outcome)
            .ok_or_else(|| Error::Internal("could not identify best result state".into()))?;
        for &possible in possibles {
            let reached = if possible == best { worth } else { 0 };
            match possible {
                Outcome::Forward(index) => self.tree.state_mut(index).record_attempt(worth, reached),
                Outcome::Reverse(index) => {
                    self.tree.state_mut(index).record_reverse_attempt(worth, reached)
                }
            }
        }
        self.propagate_probabilities()?;
        Ok(best.resolved(&self.tree))
    }

    /// Append a runtime-learned state for an observation nothing expected.
    ///
    /// The new state wraps the observed configuration, takes the performed
    /// transition as its incoming transition, and assumes reversal is
    /// possible. A reversal observation commands back to the expectation of
    /// the reversal target; when runtime states link to their planned
    /// parent, that target is the nearest planned ancestor, which lets
    /// multi-step returns re-enter the planned tree.
    fn learn_state(
        &mut self,
        previous: usize,
        expected: &[Outcome],
        performed_transition_id: TransitionId,
        current_config: &C,
        link_runtime_states_to_planned_parent: bool,
    ) -> Result<()> {
        let state_id = self.tree.len() as u64 + RUNTIME_STATE_ID_FLOOR;
        let reverse_transition_id = self.tree.len() as u64 + RUNTIME_STATE_ID_FLOOR;
        let motion_p = self.tree.state(previous).motion_p();
        let step_size = self.tree.state(previous).step_size();
        let reversal =
            performed_transition_id == self.tree.state(previous).reverse_transition_id();
        let (parent, command, attempt_count, split_id) = if reversal {
            let parent = if link_runtime_states_to_planned_parent {
                let mut working = previous;
                while self.tree.state(working).is_runtime() {
                    working = self.tree.parent(working).ok_or_else(|| {
                        Error::Internal("runtime states must descend from a planned state".into())
                    })?;
                }
                log::info!("adding a reversed state linked to planned parent ({})", working);
                working
            } else {
                log::info!("adding a reversed state linked to previous state ({})", previous);
                previous
            };
            let target = match link_runtime_states_to_planned_parent {
                true => parent,
                false => self.tree.parent(previous).ok_or_else(|| {
                    Error::Internal("cannot reverse out of the tree root".into())
                })?,
            };
            (
                parent,
                self.tree.state(target).expectation().clone(),
                self.tree.state(previous).reverse_attempts().0,
                performed_transition_id,
            )
        } else {
            let first = expected.first().copied().ok_or_else(|| {
                Error::Internal("expected result set cannot be empty".into())
            })?;
            let Outcome::Forward(exemplar) = first else {
                return Err(Error::Internal(
                    "a reversal cannot appear among forward expected results".into(),
                ));
            };
            log::info!("adding a forward state linked to previous state ({})", previous);
            (
                previous,
                self.tree.state(exemplar).command().clone(),
                self.tree.state(exemplar).attempts().0,
                self.tree.state(exemplar).split_id(),
            )
        };
        let state = State::learned(
            state_id,
            current_config.clone(),
            command,
            attempt_count,
            motion_p,
            step_size,
            performed_transition_id,
            reverse_transition_id,
            split_id,
        );
        let index = self.tree.attach(parent, state)?;
        log::info!("added runtime state ({}) under parent ({})", index, parent);
        Ok(())
    }

    /// Read the next action off the shortest-path result for the state at
    /// `index`: repeat in place at a goal state, otherwise command toward
    /// the next hop, forward when it lies downstream of the planner tree
    /// and reverse when it lies upstream.
    fn next_action(&self, index: usize) -> Result<Action<C>> {
        if index >= self.tree.len() {
            return Err(Error::InvalidInput(format!(
                "state index ({}) out of range",
                index
            )));
        }
        let state = self.tree.state(index);
        let cost = self.distances.distance(index);
        let target = self.distances.previous(index).ok_or(Error::NoSolution)?;
        if target == self.graph.sink_index() {
            // the sink has no meaningful configuration of its own, so a goal
            // state repeats its own transition toward its expectation
            log::debug!(
                "already at goal state ({}), repeating transition ({})",
                index,
                state.transition_id()
            );
            return Ok(Action::new(
                index,
                state.transition_id(),
                state.expectation().clone(),
                state.expectation().clone(),
                cost,
                false,
            ));
        }
        let next = self.tree.state(target);
        match state.state_id().cmp(&next.state_id()) {
            Ordering::Less => {
                log::info!(
                    "forward action for state ({}), transition ({})",
                    index,
                    next.transition_id()
                );
                Ok(Action::new(
                    index,
                    next.transition_id(),
                    next.command().clone(),
                    next.expectation().clone(),
                    cost,
                    false,
                ))
            }
            Ordering::Greater => {
                log::info!(
                    "reverse action for state ({}), transition ({})",
                    index,
                    state.reverse_transition_id()
                );
                Ok(Action::new(
                    index,
                    state.reverse_transition_id(),
                    next.expectation().clone(),
                    next.expectation().clone(),
                    cost,
                    true,
                ))
            }
            Ordering::Equal => Err(Error::Internal(
                "a state cannot be commanded onto itself".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use assert_approx_eq::assert_approx_eq;

    fn near(particles: &[f64], config: &f64) -> bool {
        particles.iter().any(|p| (p - config).abs() < 0.5)
    }

    fn linear() -> Tree<f64> {
        let mut tree = Tree::new(State::planned(0, 0.0, 0.0, vec![0.0]));
        let middle = tree
            .attach(
                0,
                State::planned(1, 1.0, 1.0, vec![1.0])
                    .with_edge(1.0, 1.0, 1.0)
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
        tree
    }

    fn linear_policy(marginal: f64) -> Policy<f64> {
        Policy::new(linear(), 2.0, marginal, 0.95, 10, 1).unwrap()
    }

    fn split_policy() -> Policy<f64> {
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
                .with_edge(0.4, 0.4, 1.0)
                .with_counts(10, 4, 1, 1)
                .with_transition(7, 9)
                .with_split(7, true)
                .with_goal(0.5),
        )
        .unwrap();
        Policy::new(tree, 1.0, 1.0, 0.95, 10, 1).unwrap()
    }

    #[test]
    fn cold_start_walks_the_linear_plan() {
        let mut policy = linear_policy(1.0);
        let action = policy.query_best_action(0, &0.0, false, false, near).unwrap();
        assert_eq!(action.state_index(), 0);
        assert_eq!(action.transition_id(), 10);
        assert_eq!(*action.command(), 1.0);
        assert_eq!(*action.expectation(), 1.0);
        assert!(!action.is_reverse());
        // two tree hops plus the sink hop, each at the marginal weight
        assert_approx_eq!(action.expected_cost_to_goal(), 3.0);
    }

    #[test]
    fn cold_start_cost_scales_with_the_marginal_weight() {
        let mut policy = linear_policy(2.0);
        let action = policy.query_best_action(0, &0.0, false, false, near).unwrap();
        assert_approx_eq!(action.expected_cost_to_goal(), 6.0);
    }

    #[test]
    fn cold_start_outside_the_policy_is_not_covered() {
        let mut policy = linear_policy(1.0);
        assert!(matches!(
            policy.query_best_action(0, &99.0, false, false, near),
            Err(Error::NotCovered)
        ));
    }

    #[test]
    fn goal_states_repeat_their_own_transition() {
        let mut policy = linear_policy(1.0);
        let action = policy.query_best_action(0, &2.0, false, false, near).unwrap();
        assert_eq!(action.state_index(), 2);
        assert_eq!(action.transition_id(), 20);
        assert_eq!(*action.command(), 2.0);
        assert!(!action.is_reverse());
        assert_approx_eq!(action.expected_cost_to_goal(), 1.0);
    }

    #[test]
    fn matched_forward_outcomes_absorb_the_observation() {
        let mut policy = linear_policy(1.0);
        let action = policy.query_best_action(10, &1.0, false, false, near).unwrap();
        assert_eq!(action.state_index(), 1);
        assert_eq!(action.transition_id(), 20);
        assert!(!action.is_reverse());
        let tree = policy.tree().unwrap();
        assert_eq!(tree.state(1).attempts(), (2, 2));
        assert_eq!(tree.state(1).reverse_attempts(), (1, 1));
    }

    #[test]
    fn matched_reversals_update_the_reverse_counters() {
        let mut policy = linear_policy(1.0);
        let action = policy.query_best_action(21, &1.0, false, false, near).unwrap();
        assert_eq!(action.state_index(), 1);
        assert_eq!(action.transition_id(), 20);
        assert!(!action.is_reverse());
        let tree = policy.tree().unwrap();
        assert_eq!(tree.state(2).reverse_attempts(), (2, 2));
        assert_eq!(tree.state(2).attempts(), (1, 1));
    }

    #[test]
    fn counters_grow_monotonically_across_queries() {
        let mut policy = linear_policy(1.0);
        let mut last = (1, 1);
        for _ in 0..4 {
            policy.query_best_action(10, &1.0, false, false, near).unwrap();
            let counts = policy.tree().unwrap().state(1).attempts();
            assert!(counts.0 >= last.0 && counts.1 >= last.1);
            last = counts;
        }
        assert_eq!(last, (5, 5));
    }

    #[test]
    fn observations_one_tier_down_do_not_learn() {
        let mut policy = linear_policy(1.0);
        let action = policy.query_best_action(10, &2.0, false, false, near).unwrap();
        // matched state 2, a child of the expected result; no counter moves
        assert_eq!(action.state_index(), 2);
        assert_eq!(action.transition_id(), 20);
        let tree = policy.tree().unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.state(1).attempts(), (1, 1));
        assert_eq!(tree.state(2).attempts(), (1, 1));
    }

    #[test]
    fn branch_jumping_recovers_without_learning() {
        let mut policy = linear_policy(1.0);
        let action = policy.query_best_action(10, &0.0, true, false, near).unwrap();
        assert_eq!(action.state_index(), 0);
        assert_eq!(action.transition_id(), 10);
        assert_eq!(policy.tree().unwrap().len(), 3);
    }

    #[test]
    fn unexpected_observations_grow_the_tree() {
        let mut policy = linear_policy(1.0);
        let action = policy.query_best_action(10, &5.0, false, false, near).unwrap();
        let tree = policy.tree().unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.state(3).state_id(), 3 + RUNTIME_STATE_ID_FLOOR);
        assert_eq!(tree.parent(3), Some(0));
        assert_eq!(tree.state(3).transition_id(), 10);
        assert_eq!(*tree.state(3).expectation(), 5.0);
        // the observation is credited to the new state, not the planned one
        assert_eq!(tree.state(3).attempts(), (2, 1));
        assert_eq!(tree.state(1).attempts(), (2, 1));
        // goal reachable from the stray state only by reversing out of it
        assert!(tree.state(3).goal_p() < 0.0);
        assert_eq!(action.state_index(), 3);
        assert!(action.is_reverse());
        assert_eq!(action.transition_id(), 3 + RUNTIME_STATE_ID_FLOOR);
    }

    #[test]
    fn reversals_link_back_to_the_planned_parent() {
        let mut tree = Tree::new(State::planned(0, 0.0, 0.0, vec![0.0]));
        let planned = tree
            .attach(
                0,
                State::planned(5, 1.0, 1.0, vec![1.0])
                    .with_edge(1.0, 1.0, 1.0)
                    .with_transition(50, 51),
            )
            .unwrap();
        tree.attach(
            planned,
            State::planned(6, 2.0, 2.0, vec![2.0])
                .with_edge(1.0, 1.0, 1.0)
                .with_transition(60, 61)
                .with_goal(1.0),
        )
        .unwrap();
        let runtime = tree
            .attach(
                planned,
                State::planned(RUNTIME_STATE_ID_FLOOR + 1, 3.0, 3.0, vec![3.0])
                    .with_edge(1.0, 1.0, 1.0)
                    .with_transition(70, 71),
            )
            .unwrap();
        tree.attach(
            runtime,
            State::planned(RUNTIME_STATE_ID_FLOOR + 2, 4.0, 4.0, vec![4.0])
                .with_edge(1.0, 1.0, 1.0)
                .with_transition(76, 77),
        )
        .unwrap();
        let mut policy = Policy::new(tree, 2.0, 1.0, 0.95, 10, 1).unwrap();
        let action = policy.query_best_action(77, &9.0, false, true, near).unwrap();
        let tree = policy.tree().unwrap();
        assert_eq!(tree.len(), 6);
        // attached to the planned ancestor, two runtime hops up
        assert_eq!(tree.parent(5), Some(planned));
        assert_eq!(tree.state(5).state_id(), 5 + RUNTIME_STATE_ID_FLOOR);
        assert_eq!(*tree.state(5).command(), 1.0);
        assert!(tree.state(5).is_split_child());
        assert_eq!(action.state_index(), 5);
        assert!(action.is_reverse());
        assert_eq!(action.transition_id(), 5 + RUNTIME_STATE_ID_FLOOR);
    }

    #[test]
    fn split_observations_credit_only_the_best_match() {
        let mut policy = split_policy();
        let action = policy.query_best_action(7, &1.0, false, false, near).unwrap();
        let tree = policy.tree().unwrap();
        assert_eq!(tree.state(1).attempts(), (11, 7));
        assert_eq!(tree.state(2).attempts(), (11, 4));
        assert_approx_eq!(tree.state(2).raw_edge_p(), 4.0 / 11.0);
        // probabilities were re-propagated for the whole transition: retries
        // through the reversible sibling lift the effective probability
        assert!(tree.state(1).effective_edge_p() > tree.state(1).raw_edge_p());
        assert!(tree.state(1).effective_edge_p() <= 1.0);
        assert_eq!(action.state_index(), 1);
        assert_eq!(action.transition_id(), 7);
        assert!(!action.is_reverse());
    }

    #[test]
    fn dead_branches_have_no_solution() {
        let mut tree = linear();
        tree.attach(
            1,
            State::planned(3, 5.0, 5.0, vec![5.0])
                .with_edge(0.0, 0.0, 0.0)
                .with_counts(1, 0, 0, 0)
                .with_transition(30, 31),
        )
        .unwrap();
        let mut policy = Policy::new(tree, 2.0, 1.0, 0.95, 10, 1).unwrap();
        assert!(matches!(
            policy.query_best_action(30, &5.0, false, false, near),
            Err(Error::NoSolution)
        ));
    }
}
