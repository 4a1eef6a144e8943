//! Split-sibling retry recurrence.
//!
//! A split action can land in any of several sibling outcomes sharing one
//! transition id. Retrying the action is only useful for the probability
//! mass that landed in a nominally-independent sibling and then managed to
//! reverse back to the parent; mass stuck in a dependent sibling, or stuck
//! in an independent sibling that cannot reverse, never tries again. Both
//! edge-attempt estimation and effective-probability re-propagation run
//! this same recurrence.

use crate::Probability;

/// One sibling outcome of a split, as seen from the outcome being retried
/// toward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sibling {
    pub raw_edge_p: Probability,
    pub reverse_edge_p: Probability,
    pub independent: bool,
}

/// Simulate up to `cap` attempts of a split action aimed at an outcome with
/// single-attempt probability `raw_edge_p`. Returns the cumulative
/// probability of having landed in the desired outcome together with the
/// number of attempts consumed. With a `threshold` the simulation stops as
/// soon as the cumulative probability reaches it; without one it always
/// runs the full `cap`.
pub fn simulate(
    raw_edge_p: Probability,
    siblings: &[Sibling],
    cap: u32,
    threshold: Option<f64>,
) -> (Probability, u32) {
    let mut active = 1.0;
    let mut reached = 0.0;
    for attempt in 1..=cap {
        reached += active * raw_edge_p;
        if let Some(enough) = threshold {
            if reached >= enough {
                return (reached, attempt);
            }
        }
        active = siblings
            .iter()
            .filter(|sibling| sibling.independent)
            .map(|sibling| active * sibling.raw_edge_p * sibling.reverse_edge_p)
            .sum();
    }
    (reached, cap)
}
