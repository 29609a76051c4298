//! Engram Core - the memory subsystem of a conversational assistant.
//!
//! Decides what the assistant remembers about a user, finds the right
//! memories to condition a response, and keeps the store consistent under
//! concurrent background writes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       MemoryService                          │
//! │                                                              │
//! │   ┌─────────────────┐          ┌───────────────────────┐     │
//! │   │ RetrievalEngine │          │     WritePipeline     │     │
//! │   │ lexical+vector  │◀─────────│ rate ▸ embed ▸ dedup  │     │
//! │   │ RRF ▸ budget    │  dedup   │ ▸ persist ▸ audit     │     │
//! │   └────────┬────────┘          └───────────▲───────────┘     │
//! │            │                               │                 │
//! │            │                      ┌────────┴────────┐        │
//! │            │                      │   WriteQueue    │        │
//! │            │                      │ bounded, drained│        │
//! │            ▼                      └─────────────────┘        │
//! │   ┌──────────────────────────────────────────────────┐       │
//! │   │  ItemStore · TextIndex · VectorStore · KvStore   │       │
//! │   │            AuditStorage (append-only)            │       │
//! │   └──────────────────────────────────────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation is scoped by `user_id`; cross-user leakage is a
//! security-critical invariant enforced at every layer.

pub mod config;
pub mod models;
pub mod retrieval;
pub mod service;
pub mod storage;
pub mod write;

pub use config::MemoryConfig;
pub use models::{
    AuditQuery, MemoryCategory, MemoryItem, MemoryState, MemoryStats, MemoryWriteEvent,
    RecallQuery, RecallResult, ScoredMemory, WriteOperation,
};
pub use retrieval::{HeuristicTokenCounter, RetrievalEngine, TokenCounter};
pub use service::{
    ForgetCandidate, MemoryService, RecallResponse, RecalledMemory, SaveReceipt, SaveRequest,
    SaveStatus,
};
pub use storage::{AuditStorage, MemoryStorage};
pub use write::{
    ConversationTurn, CreateMemory, DeleteOutcome, EnqueueError, EpisodeOutcome, EpisodeRequest,
    SupersedeMemory, SupersedeOutcome, TurnRole, WriteJob, WriteOutcome, WritePipeline, WriteQueue,
};
