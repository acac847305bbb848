use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use parking_lot::RwLock;

use quarry_core::types::AbortSignal;
use quarry_core::types::QuarryOptions;
use quarry_core::worker_farm::WorkerFarmRef;

use crate::watch::WatchEvents;

use super::request::Request;
use super::request::RequestId;
use super::request::RequestResult;
use super::request::RunRequestContext;
use super::request::TrackerError;
use super::request_graph::InvalidRequest;
use super::request_graph::RequestGraph;

/// Shared handles threaded through the tracker and every running request's
/// context. The graph is the single mutable resource; every mutation happens
/// in a short synchronous critical section on the owning task.
pub(crate) struct RequestTrackerState<R: RequestResult> {
  pub graph: Arc<RwLock<RequestGraph<R>>>,
  pub farm: WorkerFarmRef,
  pub options: Arc<QuarryOptions>,
  pub signal: Arc<Mutex<Option<AbortSignal>>>,
}

impl<R: RequestResult> Clone for RequestTrackerState<R> {
  fn clone(&self) -> Self {
    RequestTrackerState {
      graph: self.graph.clone(),
      farm: self.farm.clone(),
      options: self.options.clone(),
      signal: self.signal.clone(),
    }
  }
}

/// [`RequestTracker`] runs build work items and maintains the graph of what
/// they depend on.
///
/// A request is memoized under its id: running it again returns the stored
/// result until a file system event, env or option change, or startup rule
/// invalidates it. Requests declare those dependencies while they run,
/// through the [`RunRequestContext`] handed to their body, and compose by
/// running subrequests through the same context.
pub struct RequestTracker<R: RequestResult> {
  state: RequestTrackerState<R>,
}

impl<R: RequestResult> RequestTracker<R> {
  pub fn new(farm: WorkerFarmRef, options: Arc<QuarryOptions>) -> Self {
    Self::with_graph(RequestGraph::new(), farm, options)
  }

  /// Restore a tracker from previously serialized graph bytes.
  ///
  /// Bytes that fail to decode are treated as no prior state.
  pub fn from_serialized(bytes: &[u8], farm: WorkerFarmRef, options: Arc<QuarryOptions>) -> Self {
    let graph = match RequestGraph::from_bytes(bytes) {
      Ok(graph) => graph,
      Err(error) => {
        tracing::warn!(%error, "discarding unreadable request graph snapshot");
        RequestGraph::new()
      }
    };
    Self::with_graph(graph, farm, options)
  }

  fn with_graph(graph: RequestGraph<R>, farm: WorkerFarmRef, options: Arc<QuarryOptions>) -> Self {
    RequestTracker {
      state: RequestTrackerState {
        graph: Arc::new(RwLock::new(graph)),
        farm,
        options,
        signal: Arc::new(Mutex::new(None)),
      },
    }
  }

  /// Install the cancellation signal consulted after every request body.
  pub fn set_signal(&mut self, signal: AbortSignal) {
    *self.state.signal.lock() = Some(signal);
  }

  /// Run a request, returning its memoized result when it is still valid.
  pub async fn run_request<Req: Request<R>>(&self, request: Req) -> Result<R, TrackerError> {
    run_request_inner(&self.state, request).await
  }

  pub fn has_valid_result(&self, request_id: &str) -> bool {
    self.state.graph.read().has_valid_result(request_id)
  }

  pub fn get_request_result(&self, request_id: &str) -> Option<R> {
    self.state.graph.read().get_request_result(request_id)
  }

  pub fn store_result(&self, request_id: &str, result: R) -> anyhow::Result<()> {
    self.state.graph.write().store_result(request_id, result)
  }

  pub fn complete_request(&self, request_id: &str) {
    self.state.graph.write().complete_request(request_id);
  }

  pub fn reject_request(&self, request_id: &str) {
    self.state.graph.write().reject_request(request_id);
  }

  pub fn remove_request(&self, request_id: &str) {
    self.state.graph.write().remove_node(request_id);
  }

  pub fn get_subrequests(&self, request_id: &str) -> Vec<RequestId> {
    self.state.graph.read().get_subrequests(request_id)
  }

  /// Apply a batch of watcher events. Returns whether anything became
  /// invalid, i.e. whether a rebuild is needed.
  pub fn respond_to_fs_events(&self, events: &WatchEvents) -> bool {
    self.state.graph.write().respond_to_fs_events(events)
  }

  /// Invalidate requests that must re-run every process start. Called once
  /// after restoring a persisted graph.
  pub fn invalidate_unpredictable_nodes(&self) -> bool {
    self.state.graph.write().invalidate_unpredictable_nodes()
  }

  /// Invalidate requests whose captured env values differ from `env`.
  pub fn invalidate_env_nodes(&self, env: &BTreeMap<String, String>) -> bool {
    self.state.graph.write().invalidate_env_nodes(env)
  }

  /// Invalidate requests whose captured option hashes differ from `options`.
  pub fn invalidate_option_nodes(&self, options: &BTreeMap<String, serde_json::Value>) -> bool {
    self.state.graph.write().invalidate_option_nodes(options)
  }

  pub fn get_invalid_requests(&self) -> Vec<InvalidRequest> {
    self.state.graph.read().get_invalid_requests()
  }

  pub fn clear_invalid_nodes(&self) {
    self.state.graph.write().clear_invalid_nodes();
  }

  /// Serialize the graph and its indices for the next process lifetime.
  pub fn serialize_graph(&self) -> anyhow::Result<Vec<u8>> {
    self.state.graph.read().to_bytes()
  }
}

/// The runner shared by [`RequestTracker::run_request`] and subrequest runs
/// through [`RunRequestContext::run_request`].
pub(crate) async fn run_request_inner<R: RequestResult, Req: Request<R>>(
  state: &RequestTrackerState<R>,
  request: Req,
) -> Result<R, TrackerError> {
  let request_id = request.id();

  {
    let graph = state.graph.read();
    if graph.has_valid_result(&request_id) {
      tracing::trace!(%request_id, "returning memoized result");
      return graph.get_request_result(&request_id).ok_or_else(|| {
        TrackerError::RequestFailed(anyhow!("valid request {request_id} has no stored result"))
      });
    }
  }

  let (previous_invalidations, invalidate_reason) = {
    let mut graph = state.graph.write();
    let previous_invalidations = graph.get_invalidations(&request_id);
    let invalidate_reason = graph.invalidate_reason(&request_id);
    graph.start_request(&request_id, request.request_type())?;
    (previous_invalidations, invalidate_reason)
  };

  let subrequests = Arc::new(Mutex::new(BTreeSet::new()));
  let context = RunRequestContext::new(
    request_id.clone(),
    state.clone(),
    subrequests.clone(),
    previous_invalidations,
    invalidate_reason,
  );

  tracing::debug!(%request_id, request_type = request.request_type(), "run request");
  let body_result = request.run(context).await;

  let aborted = state
    .signal
    .lock()
    .as_ref()
    .is_some_and(|signal| signal.aborted());

  let result = match body_result {
    Ok(_) if aborted => Err(TrackerError::Aborted),
    Ok(value) => Ok(value),
    Err(error) => Err(TrackerError::RequestFailed(error)),
  };

  {
    let mut graph = state.graph.write();
    match &result {
      Ok(value) => {
        graph.store_result(&request_id, value.clone())?;
        graph.complete_request(&request_id);
      }
      Err(error) => {
        tracing::debug!(%request_id, %error, "request failed");
        graph.reject_request(&request_id);
      }
    }

    // Reconcile even on failure so retries start from an exact relation.
    let subrequests = std::mem::take(&mut *subrequests.lock());
    graph.replace_subrequests(&request_id, &subrequests);
  }

  result
}
