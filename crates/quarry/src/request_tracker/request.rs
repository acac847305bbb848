use std::any::TypeId;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use quarry_core::hash::IdentifierHasher;
use quarry_core::types::FileCreateInvalidation;
use quarry_core::types::Invalidation;
use quarry_core::types::QuarryOptions;
use quarry_core::worker_farm::WorkerFarmRef;

use super::node::InvalidateReason;
use super::request_tracker::run_request_inner;
use super::request_tracker::RequestTrackerState;

/// Stable identifier of a request, derived from its type and hashed fields.
pub type RequestId = String;

/// Errors raised by request implementations.
pub type RunRequestError = anyhow::Error;

/// User visible failures surfaced by the tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
  /// A request body returned an error; the cause is preserved verbatim.
  #[error(transparent)]
  RequestFailed(#[from] anyhow::Error),

  /// A file create invalidation was declared with an unusable shape.
  #[error("invalid file create invalidation: {reason}")]
  InvalidInvalidation { reason: String },

  /// The shared abort signal fired while a request was running.
  #[error("the build was aborted")]
  Aborted,
}

/// Bound for the opaque result values stored on request nodes.
///
/// The tracker never inspects results; it only clones them for memoization
/// and round-trips them through graph serialization.
pub trait RequestResult:
  Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> RequestResult for T where
  T: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// A memoizable unit of build work.
///
/// The hashed fields of the implementing type are the request's input: two
/// requests with equal ids are the same piece of work and share one node in
/// the request graph. The [`RunRequestContext`] passed to
/// [`Request::run`] is the only channel for declaring dependencies; reads
/// that bypass it are invisible to the tracker and break incrementality.
#[async_trait]
pub trait Request<R: RequestResult>: Hash + Send + Sync + Debug + 'static {
  /// Stable id for this request, used as its node id in the request graph.
  fn id(&self) -> RequestId
  where
    Self: Sized,
  {
    let mut hasher = IdentifierHasher::default();
    TypeId::of::<Self>().hash(&mut hasher);
    self.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
  }

  /// Human readable tag recorded on the request node for reporting.
  fn request_type(&self) -> &'static str {
    std::any::type_name::<Self>()
  }

  async fn run(&self, context: RunRequestContext<R>) -> Result<R, RunRequestError>;
}

/// The API handed to a running request body.
///
/// Every mutator scopes to the request that owns the context, so a body can
/// only declare dependencies for itself. Mutators are synchronous; only
/// [`RunRequestContext::run_request`] suspends.
pub struct RunRequestContext<R: RequestResult> {
  request_id: RequestId,
  state: RequestTrackerState<R>,
  subrequests: Arc<Mutex<BTreeSet<RequestId>>>,
  previous_invalidations: Vec<Invalidation>,
  invalidate_reason: InvalidateReason,
}

impl<R: RequestResult> RunRequestContext<R> {
  pub(crate) fn new(
    request_id: RequestId,
    state: RequestTrackerState<R>,
    subrequests: Arc<Mutex<BTreeSet<RequestId>>>,
    previous_invalidations: Vec<Invalidation>,
    invalidate_reason: InvalidateReason,
  ) -> Self {
    Self {
      request_id,
      state,
      subrequests,
      previous_invalidations,
      invalidate_reason,
    }
  }

  /// Re-run whenever the file at `path` changes.
  pub fn invalidate_on_file_update(&self, path: impl Into<PathBuf>) -> anyhow::Result<()> {
    self
      .state
      .graph
      .write()
      .invalidate_on_file_update(&self.request_id, path.into())
  }

  /// Re-run if the file at `path` disappears.
  pub fn invalidate_on_file_delete(&self, path: impl Into<PathBuf>) -> anyhow::Result<()> {
    self
      .state
      .graph
      .write()
      .invalidate_on_file_delete(&self.request_id, path.into())
  }

  /// Re-run if a file matching `input` appears.
  pub fn invalidate_on_file_create(&self, input: &FileCreateInvalidation) -> anyhow::Result<()> {
    self
      .state
      .graph
      .write()
      .invalidate_on_file_create(&self.request_id, input)
  }

  /// Re-run at least once per process start.
  pub fn invalidate_on_startup(&self) -> anyhow::Result<()> {
    self
      .state
      .graph
      .write()
      .invalidate_on_startup(&self.request_id)
  }

  /// Re-run when the named environment variable no longer has the value it
  /// has right now.
  pub fn invalidate_on_env_change(&self, name: impl Into<String>) -> anyhow::Result<()> {
    let name = name.into();
    let value = self.state.options.env.get(&name).cloned();
    self
      .state
      .graph
      .write()
      .invalidate_on_env_change(&self.request_id, name, value)
  }

  /// Re-run when the named option no longer hashes to its current value.
  pub fn invalidate_on_option_change(&self, name: impl Into<String>) -> anyhow::Result<()> {
    let name = name.into();
    let value = self
      .state
      .options
      .options
      .get(&name)
      .cloned()
      .unwrap_or(serde_json::Value::Null);
    self
      .state
      .graph
      .write()
      .invalidate_on_option_change(&self.request_id, name, &value)
  }

  /// The invalidations this request had declared on its previous run,
  /// captured before they were cleared for this run.
  pub fn get_invalidations(&self) -> Vec<Invalidation> {
    self.previous_invalidations.clone()
  }

  /// Why this run was triggered. Empty on the first run.
  pub fn invalidate_reason(&self) -> InvalidateReason {
    self.invalidate_reason
  }

  /// Store an intermediate result on the request node. The value returned
  /// from the request body overwrites it on success.
  pub fn store_result(&self, result: R) -> anyhow::Result<()> {
    self
      .state
      .graph
      .write()
      .store_result(&self.request_id, result)
  }

  /// The subrequest ids this request has declared so far during this run.
  pub fn get_subrequests(&self) -> Vec<RequestId> {
    self.subrequests.lock().iter().cloned().collect()
  }

  /// Run `request` as a subrequest of the current request, memoized through
  /// the tracker. The subrequest edge is recorded regardless of whether the
  /// child succeeds.
  pub async fn run_request<Req: Request<R>>(&self, request: Req) -> Result<R, TrackerError> {
    self.subrequests.lock().insert(request.id());
    run_request_inner(&self.state, request).await
  }

  pub fn farm(&self) -> &WorkerFarmRef {
    &self.state.farm
  }

  pub fn options(&self) -> &QuarryOptions {
    &self.state.options
  }
}
