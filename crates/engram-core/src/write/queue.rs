//! Bounded background write queue.
//!
//! Writes triggered by a tool call are decoupled from the turn's reply
//! latency: they are enqueued here and run as independent tokio tasks. The
//! queue is bounded and sheds with [`EnqueueError::Full`] rather than
//! growing without limit. In-flight jobs are tracked in a JoinSet; shutdown
//! closes intake and drains with a bounded timeout, logging and abandoning
//! stragglers (best-effort durability, not exactly-once).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::MemoryConfig;
use crate::write::pipeline::{CreateMemory, EpisodeRequest, WritePipeline};

/// A unit of background write work.
#[derive(Debug, Clone)]
pub enum WriteJob {
    Create(CreateMemory),
    Episode(EpisodeRequest),
}

/// Reasons an enqueue can be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the write is shed.
    Full,
    /// The queue has been shut down.
    Closed,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::Full => write!(f, "write queue is full"),
            EnqueueError::Closed => write!(f, "write queue is shut down"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Bounded queue of fire-and-forget memory writes.
pub struct WriteQueue {
    tx: Mutex<Option<mpsc::Sender<WriteJob>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    drain_timeout: std::time::Duration,
}

impl WriteQueue {
    /// Start the queue and its dispatcher task.
    pub fn start(pipeline: Arc<WritePipeline>, config: &MemoryConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(config.queue_depth);
        let drain_timeout = config.drain_timeout();

        let dispatcher = tokio::spawn(async move {
            let mut in_flight: JoinSet<()> = JoinSet::new();

            while let Some(job) = rx.recv().await {
                let pipeline = pipeline.clone();
                in_flight.spawn(async move {
                    run_job(pipeline, job).await;
                });

                // Reap finished jobs without blocking intake
                while let Some(result) = in_flight.try_join_next() {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "background write task failed");
                    }
                }
            }

            // Intake closed: drain in-flight writes with a bounded timeout
            let remaining = in_flight.len();
            if remaining > 0 {
                tracing::info!(in_flight = remaining, "draining background writes");
            }
            let drain = async {
                while let Some(result) = in_flight.join_next().await {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "background write task failed");
                    }
                }
            };
            let drained = tokio::time::timeout(drain_timeout, drain).await;
            if drained.is_err() {
                tracing::warn!(
                    abandoned = in_flight.len(),
                    "shutdown drain timed out; abandoning in-flight writes"
                );
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            drain_timeout,
        }
    }

    /// Enqueue a job without waiting. A full queue sheds the job.
    pub fn try_enqueue(&self, job: WriteJob) -> Result<(), EnqueueError> {
        let sender = {
            let guard = self.tx.lock();
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(EnqueueError::Closed);
        };

        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close intake and wait for the dispatcher to drain.
    ///
    /// Bounded: the dispatcher's own drain timeout applies, so this returns
    /// within roughly that window even when jobs hang.
    pub async fn shutdown(&self) {
        let _ = self.tx.lock().take();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            // Outer guard in case the dispatcher itself is stuck
            let grace = self.drain_timeout + std::time::Duration::from_secs(1);
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("write queue dispatcher did not stop in time");
            }
        }
    }
}

async fn run_job(pipeline: Arc<WritePipeline>, job: WriteJob) {
    match job {
        WriteJob::Create(request) => {
            let user_id = request.user_id.clone();
            let outcome = pipeline.create(request).await;
            tracing::debug!(user_id = %user_id, outcome = ?outcome, "background create finished");
        }
        WriteJob::Episode(request) => {
            let conversation_id = request.conversation_id.clone();
            let outcome = pipeline.summarize_episode(request).await;
            tracing::debug!(conversation_id = %conversation_id, outcome = ?outcome, "background episode finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemoryCategory;
    use crate::retrieval::{HeuristicTokenCounter, RetrievalEngine};
    use crate::storage::{AuditStorage, MemoryStorage};
    use engram_ai::{CachedEmbedder, MockCompletion, MockEmbedding};
    use engram_storage::{KvStore, TextIndex, VectorConfig, VectorStore, in_memory_database};

    const DIM: usize = 32;

    fn build_pipeline(config: &MemoryConfig) -> (Arc<WritePipeline>, MemoryStorage) {
        let db = in_memory_database().unwrap();
        let storage = MemoryStorage::new(db.clone()).unwrap();
        let audit = AuditStorage::new(db.clone()).unwrap();
        let text_index = Arc::new(TextIndex::in_memory().unwrap());
        let vectors = Arc::new(
            VectorStore::new(
                db.clone(),
                VectorConfig {
                    dimension: DIM,
                    max_connections: 8,
                    ef_construction: 100,
                    max_elements: 1000,
                },
            )
            .unwrap(),
        );
        let kv = KvStore::new(db).unwrap();
        let embedder = Arc::new(CachedEmbedder::new(
            Arc::new(MockEmbedding::new(DIM)),
            kv.clone(),
        ));
        let retrieval = Arc::new(RetrievalEngine::new(
            storage.clone(),
            text_index.clone(),
            vectors.clone(),
            embedder.clone(),
            Arc::new(HeuristicTokenCounter),
            config.clone(),
        ));

        let pipeline = Arc::new(WritePipeline::new(
            storage.clone(),
            audit,
            text_index,
            vectors,
            embedder,
            kv,
            Arc::new(MockCompletion::new("episode summary")),
            retrieval,
            config.clone(),
        ));

        (pipeline, storage)
    }

    fn create_job(user_id: &str, content: &str) -> WriteJob {
        WriteJob::Create(CreateMemory {
            user_id: user_id.to_string(),
            content: content.to_string(),
            category: MemoryCategory::Note,
            confidence: 0.9,
            importance: 0.5,
            source_conversation_id: None,
            correlation_id: None,
            source: None,
        })
    }

    #[tokio::test]
    async fn test_enqueued_writes_complete_on_shutdown() {
        let config = MemoryConfig::default();
        let (pipeline, storage) = build_pipeline(&config);
        let queue = WriteQueue::start(pipeline, &config);

        for i in 0..5 {
            queue
                .try_enqueue(create_job("user-1", &format!("background note {}", i)))
                .unwrap();
        }

        queue.shutdown().await;

        let items = storage.list_active("user-1").unwrap();
        assert_eq!(items.len(), 5);
    }

    #[tokio::test]
    async fn test_full_queue_sheds() {
        let mut config = MemoryConfig::default();
        config.queue_depth = 2;
        let (pipeline, _storage) = build_pipeline(&config);
        let queue = WriteQueue::start(pipeline, &config);

        // Flood faster than the dispatcher can drain; some sends must shed
        let mut shed = 0;
        for i in 0..200 {
            if queue
                .try_enqueue(create_job("user-1", &format!("burst {}", i)))
                .is_err()
            {
                shed += 1;
            }
        }
        assert!(shed > 0, "a bounded queue under flood must shed");

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_closed() {
        let config = MemoryConfig::default();
        let (pipeline, _storage) = build_pipeline(&config);
        let queue = WriteQueue::start(pipeline, &config);

        queue.shutdown().await;

        let result = queue.try_enqueue(create_job("user-1", "too late"));
        assert_eq!(result, Err(EnqueueError::Closed));
    }
}
