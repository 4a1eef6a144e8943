pub mod codec;
pub mod error;
pub mod graph;
pub mod plan;
pub mod policy;
pub mod retry;

pub use codec::Config;
pub use error::Error;
pub use plan::state::State;
pub use plan::tree::Tree;
pub use policy::action::Action;
pub use policy::Policy;

/// dimensional analysis types
pub type Probability = f64;
pub type Cost = f64;
pub type StateId = u64;
pub type TransitionId = u64;

/// states with ids at or above this floor were learned during execution;
/// everything below came out of the offline planner
pub const RUNTIME_STATE_ID_FLOOR: StateId = 1_000_000_000;

/// accumulated rounding may push a probability slightly past 1.0;
/// overshoot within this bound is clamped, anything larger is an error
pub const P_OVERSHOOT_TOLERANCE: f64 = 0.001;

/// trait for random generation, mainly (strictly?) for testing
pub trait Arbitrary {
    fn random() -> Self;
}
