//! Time-bounded calls over a peer connection.
//!
//! A timeout means "outcome unknown": the remote side is not told to stop.

use hostagent_types::error::{PlatformError, PlatformResult};
use hostagent_wire::PeerConnection;
use serde_json::{Map, Value};
use std::time::Duration;

/// Call `method` on `peer`, failing with `Unreachable` after `timeout`.
pub async fn bounded_call(
    conn: &dyn PeerConnection,
    peer: &str,
    method: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    timeout: Duration,
) -> PlatformResult<Value> {
    match tokio::time::timeout(timeout, conn.call(peer, method, args, kwargs)).await {
        Ok(result) => result.map_err(PlatformError::from),
        Err(_) => Err(PlatformError::Unreachable(format!(
            "{peer}.{method} did not answer within {}s",
            timeout.as_secs()
        ))),
    }
}

/// Ping `peer`, failing with `Unreachable` after `timeout` or on any error.
pub async fn bounded_ping(conn: &dyn PeerConnection, peer: &str, timeout: Duration) -> PlatformResult<()> {
    match tokio::time::timeout(timeout, conn.ping(peer)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PlatformError::Unreachable(format!("{peer}: {e}"))),
        Err(_) => Err(PlatformError::Unreachable(format!(
            "{peer} did not answer ping within {}s",
            timeout.as_secs()
        ))),
    }
}
