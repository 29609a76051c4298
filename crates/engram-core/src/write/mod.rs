//! Memory write path: pipeline, outcomes, background queue.

pub mod pipeline;
pub mod queue;

pub use pipeline::{
    ConversationTurn, CreateMemory, DeleteOutcome, EpisodeOutcome, EpisodeRequest,
    SupersedeMemory, SupersedeOutcome, TurnRole, WriteOutcome, WritePipeline,
};
pub use queue::{EnqueueError, WriteJob, WriteQueue};
