//! A replicated state: the user of a replicated log that applies its committed entries to a
//! state machine.

mod replicated_state;
mod state_machine;

pub use replicated_state::ReplicatedState;
pub use state_machine::SnapshotError;
pub use state_machine::StateMachine;
