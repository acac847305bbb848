use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// The options passed into quarry either through the CLI or the programmatic
/// API.
///
/// The tracker reads `env` and `options` when a request declares env or
/// option invalidations; everything else is carried through to request
/// implementations untouched.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarryOptions {
  /// Environment variables visible to request implementations.
  #[serde(default)]
  pub env: BTreeMap<String, String>,

  /// Named configuration values requests may depend on through option
  /// invalidations. Values are compared by stable hash, so structurally
  /// equal configurations match across runs.
  #[serde(default)]
  pub options: BTreeMap<String, serde_json::Value>,

  #[serde(default)]
  pub project_root: PathBuf,
}
