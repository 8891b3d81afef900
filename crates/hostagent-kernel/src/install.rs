//! Install pipeline for uploaded agent packages.
//!
//! Each upload is `{file_name, file}` where `file` is base64, optionally
//! behind a data-URL prefix ending in `base64,`. Files are staged in a
//! fresh temp directory and handed to the control service one by one.

use crate::control::ControlService;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hostagent_types::error::{PlatformError, PlatformResult};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info};

/// Result for one uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InstallOutcome {
    Installed { uuid: String },
    Failed { error: String },
}

/// Reduce `file_name` to its final path component. Names with no usable
/// component (`""`, `".."`, `"/"`) are rejected.
fn base_name(file_name: &str) -> PlatformResult<&str> {
    Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PlatformError::InvalidParams(format!("bad file name {file_name:?}")))
}

/// Decode the payload after `base64,`, or the whole string when there is
/// no such marker.
fn decode_payload(file: &str) -> PlatformResult<Vec<u8>> {
    let payload = file.split_once("base64,").map(|(_, p)| p).unwrap_or(file);
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| PlatformError::InvalidParams(format!("file is not valid base64: {e}")))
}

async fn install_one(
    control: &dyn ControlService,
    staging: &Path,
    entry: &Value,
    timeout: Duration,
) -> PlatformResult<String> {
    let file_name = entry
        .get("file_name")
        .and_then(Value::as_str)
        .ok_or_else(|| PlatformError::InvalidParams("missing file_name".into()))?;
    let file = entry
        .get("file")
        .and_then(Value::as_str)
        .ok_or_else(|| PlatformError::InvalidParams(format!("missing file for {file_name}")))?;

    let path = staging.join(base_name(file_name)?);
    let bytes = decode_payload(file)?;
    tokio::fs::write(&path, &bytes).await?;
    debug!(path = %path.display(), size = bytes.len(), "Staged agent package");

    control.send_agent(&path, timeout).await
}

/// Install every file in order. A failing file yields an error entry and
/// never stops the rest.
pub async fn install_agents(
    control: &dyn ControlService,
    files: &[Value],
    timeout: Duration,
) -> PlatformResult<Vec<InstallOutcome>> {
    if files.is_empty() {
        return Ok(Vec::new());
    }

    let staging = tempfile::Builder::new()
        .prefix("hostagent-install-")
        .tempdir()?;

    let mut results = Vec::with_capacity(files.len());
    for entry in files {
        match install_one(control, staging.path(), entry, timeout).await {
            Ok(uuid) => {
                info!(uuid = %uuid, "Agent installed");
                results.push(InstallOutcome::Installed { uuid });
            }
            Err(e) => {
                error!(error = %e, "Agent install failed");
                results.push(InstallOutcome::Failed { error: e.detail() });
            }
        }
    }

    if let Err(e) = staging.close() {
        debug!(error = %e, "Could not remove install staging directory");
    }
    Ok(results)
}
