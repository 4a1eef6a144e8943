pub mod state;
pub mod tree;

pub use state::State;
pub use tree::Slot;
pub use tree::Tree;
