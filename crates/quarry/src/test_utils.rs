use std::sync::Arc;

use async_trait::async_trait;

use quarry_core::types::QuarryOptions;
use quarry_core::worker_farm::WorkerFarm;
use quarry_core::worker_farm::WorkerFarmRef;
use quarry_core::worker_farm::WorkerJob;

use crate::request_tracker::RequestResult;
use crate::request_tracker::RequestTracker;

/// Worker farm that runs jobs inline on the calling task and echoes their
/// payload back. Stands in for the real pool in tests.
#[derive(Debug, Default)]
pub struct TestingWorkerFarm;

#[async_trait]
impl WorkerFarm for TestingWorkerFarm {
  async fn run_job(&self, job: WorkerJob) -> anyhow::Result<Vec<u8>> {
    Ok(job.payload)
  }
}

#[derive(Default)]
pub struct RequestTrackerTestOptions {
  pub options: QuarryOptions,
  pub farm: Option<WorkerFarmRef>,
}

pub fn request_tracker<R: RequestResult>(
  test_options: RequestTrackerTestOptions,
) -> RequestTracker<R> {
  let RequestTrackerTestOptions { options, farm } = test_options;
  let farm = farm.unwrap_or_else(|| Arc::new(TestingWorkerFarm));

  RequestTracker::new(farm, Arc::new(options))
}
