use crate::codec;
use crate::codec::Config;
use crate::error::Error;
use crate::error::Result;
use crate::Arbitrary;
use crate::Probability;
use crate::StateId;
use crate::TransitionId;
use crate::RUNTIME_STATE_ID_FLOOR;

/// A single belief state of the planner tree.
///
/// A state records where the planner expected the robot to be
/// (`expectation`, with `particles` carrying the belief spread), what was
/// commanded to get here (`command`), the probabilities of its incoming and
/// reverse transitions, and the attempt/reached counters those probabilities
/// are re-derived from once execution starts observing outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct State<C: Config> {
    state_id: StateId,
    expectation: C,
    command: C,
    particles: Vec<C>,
    attempt_count: u32,
    reached_count: u32,
    reverse_attempt_count: u32,
    reverse_reached_count: u32,
    raw_edge_p: Probability,
    effective_edge_p: Probability,
    reverse_edge_p: Probability,
    goal_p: Probability,
    motion_p: Probability,
    step_size: f64,
    transition_id: TransitionId,
    reverse_transition_id: TransitionId,
    split_id: u64,
    independent_outcomes: bool,
}

impl<C: Config> State<C> {
    /// a state with no incoming transition: the tree root, or the raw goal
    /// configuration wrapped for the synthetic sink
    pub fn anchor(config: C) -> Self {
        Self {
            state_id: 0,
            expectation: config.clone(),
            command: config.clone(),
            particles: vec![config],
            attempt_count: 1,
            reached_count: 1,
            reverse_attempt_count: 0,
            reverse_reached_count: 0,
            raw_edge_p: 1.0,
            effective_edge_p: 1.0,
            reverse_edge_p: 0.0,
            goal_p: 0.0,
            motion_p: 1.0,
            step_size: 0.0,
            transition_id: 0,
            reverse_transition_id: 0,
            split_id: 0,
            independent_outcomes: true,
        }
    }

    /// a state produced by the offline planner; probabilities, counters,
    /// transitions and split metadata are filled in with the `with_` methods
    pub fn planned(state_id: StateId, expectation: C, command: C, particles: Vec<C>) -> Self {
        Self {
            state_id,
            expectation,
            command,
            particles,
            attempt_count: 1,
            reached_count: 1,
            reverse_attempt_count: 1,
            reverse_reached_count: 1,
            raw_edge_p: 1.0,
            effective_edge_p: 1.0,
            reverse_edge_p: 1.0,
            goal_p: 0.0,
            motion_p: 1.0,
            step_size: 0.0,
            transition_id: 0,
            reverse_transition_id: 0,
            split_id: 0,
            independent_outcomes: true,
        }
    }

    /// a state learned during execution: the observed configuration is the
    /// whole belief, nothing has reached it yet, and reversal is assumed
    /// possible until proven otherwise
    pub(crate) fn learned(
        state_id: StateId,
        config: C,
        command: C,
        attempt_count: u32,
        motion_p: Probability,
        step_size: f64,
        transition_id: TransitionId,
        reverse_transition_id: TransitionId,
        split_id: u64,
    ) -> Self {
        Self {
            state_id,
            expectation: config.clone(),
            command,
            particles: vec![config],
            attempt_count,
            reached_count: 0,
            reverse_attempt_count: 1,
            reverse_reached_count: 1,
            raw_edge_p: 0.0,
            effective_edge_p: 0.0,
            reverse_edge_p: 1.0,
            goal_p: 0.0,
            motion_p,
            step_size,
            transition_id,
            reverse_transition_id,
            split_id,
            independent_outcomes: true,
        }
    }

    pub fn with_edge(mut self, raw: Probability, effective: Probability, reverse: Probability) -> Self {
        self.raw_edge_p = raw;
        self.effective_edge_p = effective;
        self.reverse_edge_p = reverse;
        self
    }

    pub fn with_goal(mut self, goal_p: Probability) -> Self {
        self.goal_p = goal_p;
        self
    }

    pub fn with_counts(mut self, attempt: u32, reached: u32, reverse_attempt: u32, reverse_reached: u32) -> Self {
        self.attempt_count = attempt;
        self.reached_count = reached;
        self.reverse_attempt_count = reverse_attempt;
        self.reverse_reached_count = reverse_reached;
        self
    }

    pub fn with_transition(mut self, forward: TransitionId, reverse: TransitionId) -> Self {
        self.transition_id = forward;
        self.reverse_transition_id = reverse;
        self
    }

    pub fn with_split(mut self, split_id: u64, independent_outcomes: bool) -> Self {
        self.split_id = split_id;
        self.independent_outcomes = independent_outcomes;
        self
    }

    pub fn with_motion(mut self, motion_p: Probability, step_size: f64) -> Self {
        self.motion_p = motion_p;
        self.step_size = step_size;
        self
    }

    pub fn state_id(&self) -> StateId {
        self.state_id
    }
    pub fn expectation(&self) -> &C {
        &self.expectation
    }
    pub fn command(&self) -> &C {
        &self.command
    }
    pub fn particles(&self) -> &[C] {
        &self.particles
    }
    pub fn raw_edge_p(&self) -> Probability {
        self.raw_edge_p
    }
    pub fn effective_edge_p(&self) -> Probability {
        self.effective_edge_p
    }
    pub fn reverse_edge_p(&self) -> Probability {
        self.reverse_edge_p
    }
    pub fn goal_p(&self) -> Probability {
        self.goal_p
    }
    pub fn motion_p(&self) -> Probability {
        self.motion_p
    }
    pub fn step_size(&self) -> f64 {
        self.step_size
    }
    pub fn transition_id(&self) -> TransitionId {
        self.transition_id
    }
    pub fn reverse_transition_id(&self) -> TransitionId {
        self.reverse_transition_id
    }
    pub fn split_id(&self) -> u64 {
        self.split_id
    }
    pub fn attempts(&self) -> (u32, u32) {
        (self.attempt_count, self.reached_count)
    }
    pub fn reverse_attempts(&self) -> (u32, u32) {
        (self.reverse_attempt_count, self.reverse_reached_count)
    }
    pub fn independent_outcomes(&self) -> bool {
        self.independent_outcomes
    }
    pub fn is_planned(&self) -> bool {
        self.state_id < RUNTIME_STATE_ID_FLOOR
    }
    pub fn is_runtime(&self) -> bool {
        !self.is_planned()
    }
    pub fn is_split_child(&self) -> bool {
        self.split_id > 0
    }

    pub(crate) fn set_effective_edge_p(&mut self, p: Probability) {
        self.effective_edge_p = p;
    }

    pub(crate) fn set_goal_p(&mut self, p: Probability) {
        self.goal_p = p;
    }

    /// fold observed forward outcomes into the counters; the raw edge
    /// probability follows the counters once any attempt is on record
    pub(crate) fn record_attempt(&mut self, attempts: u32, reached: u32) {
        self.attempt_count = add_with_overflow_clamp(self.attempt_count, attempts);
        self.reached_count = add_with_overflow_clamp(self.reached_count, reached);
        if self.attempt_count > 0 {
            self.raw_edge_p = f64::from(self.reached_count) / f64::from(self.attempt_count);
        }
    }

    /// fold observed reversal outcomes into the reverse counters
    pub(crate) fn record_reverse_attempt(&mut self, attempts: u32, reached: u32) {
        self.reverse_attempt_count = add_with_overflow_clamp(self.reverse_attempt_count, attempts);
        self.reverse_reached_count = add_with_overflow_clamp(self.reverse_reached_count, reached);
        if self.reverse_attempt_count > 0 {
            self.reverse_edge_p =
                f64::from(self.reverse_reached_count) / f64::from(self.reverse_attempt_count);
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> u64 {
        let mut written = codec::put_u64(buf, self.state_id);
        written += codec::put_u64(buf, self.transition_id);
        written += codec::put_u64(buf, self.reverse_transition_id);
        written += codec::put_u64(buf, self.split_id);
        written += codec::put_u32(buf, self.attempt_count);
        written += codec::put_u32(buf, self.reached_count);
        written += codec::put_u32(buf, self.reverse_attempt_count);
        written += codec::put_u32(buf, self.reverse_reached_count);
        written += codec::put_f64(buf, self.raw_edge_p);
        written += codec::put_f64(buf, self.effective_edge_p);
        written += codec::put_f64(buf, self.reverse_edge_p);
        written += codec::put_f64(buf, self.goal_p);
        written += codec::put_f64(buf, self.motion_p);
        written += codec::put_f64(buf, self.step_size);
        written += codec::put_u8(buf, u8::from(self.independent_outcomes));
        written += self.expectation.encode(buf);
        written += self.command.encode(buf);
        written += codec::put_seq(buf, &self.particles, |p, b| p.encode(b));
        written
    }

    pub fn decode(buf: &[u8], at: u64) -> Result<(Self, u64)> {
        let mut consumed = 0;
        let (state_id, read) = codec::get_u64(buf, at + consumed)?;
        consumed += read;
        let (transition_id, read) = codec::get_u64(buf, at + consumed)?;
        consumed += read;
        let (reverse_transition_id, read) = codec::get_u64(buf, at + consumed)?;
        consumed += read;
        let (split_id, read) = codec::get_u64(buf, at + consumed)?;
        consumed += read;
        let (attempt_count, read) = codec::get_u32(buf, at + consumed)?;
        consumed += read;
        let (reached_count, read) = codec::get_u32(buf, at + consumed)?;
        consumed += read;
        let (reverse_attempt_count, read) = codec::get_u32(buf, at + consumed)?;
        consumed += read;
        let (reverse_reached_count, read) = codec::get_u32(buf, at + consumed)?;
        consumed += read;
        let (raw_edge_p, read) = codec::get_f64(buf, at + consumed)?;
        consumed += read;
        let (effective_edge_p, read) = codec::get_f64(buf, at + consumed)?;
        consumed += read;
        let (reverse_edge_p, read) = codec::get_f64(buf, at + consumed)?;
        consumed += read;
        let (goal_p, read) = codec::get_f64(buf, at + consumed)?;
        consumed += read;
        let (motion_p, read) = codec::get_f64(buf, at + consumed)?;
        consumed += read;
        let (step_size, read) = codec::get_f64(buf, at + consumed)?;
        consumed += read;
        let (independent, read) = codec::get_u8(buf, at + consumed)?;
        consumed += read;
        let (expectation, read) = C::decode(buf, at + consumed)?;
        consumed += read;
        let (command, read) = C::decode(buf, at + consumed)?;
        consumed += read;
        let (particles, read) = codec::get_seq(buf, at + consumed, C::decode)?;
        consumed += read;
        let state = Self {
            state_id,
            expectation,
            command,
            particles,
            attempt_count,
            reached_count,
            reverse_attempt_count,
            reverse_reached_count,
            raw_edge_p,
            effective_edge_p,
            reverse_edge_p,
            goal_p,
            motion_p,
            step_size,
            transition_id,
            reverse_transition_id,
            split_id,
            independent_outcomes: match independent {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::Malformed(format!(
                        "independence flag must be 0 or 1, got {}",
                        other
                    )))
                }
            },
        };
        Ok((state, consumed))
    }
}

impl<C: Config> std::fmt::Display for State<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "state {} at {:?} (raw {:.3} effective {:.3} reverse {:.3} goal {:.3})",
            self.state_id,
            self.expectation,
            self.raw_edge_p,
            self.effective_edge_p,
            self.reverse_edge_p,
            self.goal_p,
        )
    }
}

impl Arbitrary for State<f64> {
    fn random() -> Self {
        use rand::Rng;
        use rand::SeedableRng;
        let mut rng = rand::rngs::SmallRng::from_os_rng();
        let expectation = rng.random_range(-10.0..10.0);
        let command = expectation + rng.random_range(-1.0..1.0);
        Self::planned(
            rng.random_range(0..1000),
            expectation,
            command,
            vec![expectation; rng.random_range(1..8)],
        )
        .with_edge(rng.random(), rng.random(), rng.random())
        .with_transition(rng.random_range(1..100), rng.random_range(100..200))
    }
}

fn add_with_overflow_clamp(original: u32, additional: u32) -> u32 {
    if additional == 0 {
        return original;
    }
    match original.checked_add(additional) {
        Some(sum) => sum,
        None => {
            log::warn!("clamping on overflow of a u32 attempt counter");
            u32::MAX
        }
    }
}
