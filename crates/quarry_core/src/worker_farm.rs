use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

pub type WorkerFarmRef = Arc<dyn WorkerFarm>;

/// A CPU-heavy unit of work a request implementation hands to the pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerJob {
  /// Which worker entry point should handle this job.
  pub kind: String,
  /// Serialized job input; the worker owns the encoding.
  pub payload: Vec<u8>,
}

/// Contract for the external worker pool.
///
/// Request bodies dispatch jobs through this handle and await their results
/// before resuming graph mutation on the owning task. The tracker itself only
/// passes the reference along; it never schedules work on the pool.
#[async_trait]
pub trait WorkerFarm: Debug + Send + Sync {
  async fn run_job(&self, job: WorkerJob) -> anyhow::Result<Vec<u8>>;
}
