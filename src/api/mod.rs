//! The client-facing API of a replicated log: building and configuring a participant, and the
//! handle its user connects to it.
mod configuration;
mod error;
mod options;
mod replicated_log;
mod state_handle;

pub use configuration::LogPlanConfig;
pub use configuration::LogPlanTermSpecification;
pub use configuration::ParticipantFlags;
pub use configuration::ParticipantsConfig;
pub use error::ReplicatedLogError;
pub use options::ReplicatedLogOptions;
pub use replicated_log::Connection;
pub use replicated_log::ReplicatedLog;
pub use replicated_log::ReplicatedLogConfig;
pub use state_handle::FollowerMethods;
pub use state_handle::LeaderMethods;
pub use state_handle::ParticipantMethods;
pub use state_handle::ReplicatedStateHandle;
pub use state_handle::WaitForResult;

// So participants can read their tuning.
pub(crate) use options::LeaderOptions;
pub(crate) use options::ReplicatedLogOptionsValidated;
