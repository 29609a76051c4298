//! Data models for the memory subsystem.

pub mod audit;
pub mod memory;

pub use audit::{AuditQuery, MemoryWriteEvent, WriteOperation};
pub use memory::{
    MemoryCategory, MemoryItem, MemoryState, MemoryStats, RecallQuery, RecallResult, ScoredMemory,
};
