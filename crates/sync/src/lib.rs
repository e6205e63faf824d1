//! Account sync: stores, token lifecycle, metric normalization, remote
//! reconciliation and the job queue with its worker pool.

pub mod metric_store;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod sync_engine;
pub mod tokens;
pub mod worker;

pub use metric_store::{normalize, MetricStore, MetricTotals};
pub use queue::{DeadLetter, EnqueueOutcome, JobQueue, MemoryJobQueue, QueueStats, RetryPolicy};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use store::{AccountStore, CampaignStore};
pub use sync_engine::{bounded, SyncEngine, SyncReport};
pub use tokens::{RefreshSweep, TokenManager};
pub use worker::{JobHandler, JobOutcome, WorkerPool};
