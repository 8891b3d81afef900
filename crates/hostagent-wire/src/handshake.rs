//! HMAC-authenticated handshake shared by client and node.
//!
//! Both directions prove knowledge of the pre-shared secret by signing
//! `nonce + identity` with HMAC-SHA256.

use crate::message::{WireRequest, WireResponse, PROTOCOL_VERSION};
use crate::transport::WireError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generate HMAC-SHA256 signature for message authentication.
pub fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
pub fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

fn signed_nonce(secret: &str, identity: &str) -> (String, String) {
    let nonce = uuid::Uuid::new_v4().to_string();
    let auth_hmac = hmac_sign(secret, format!("{nonce}{identity}").as_bytes());
    (nonce, auth_hmac)
}

/// Build the opening handshake for a connecting peer.
pub fn client_hello(secret: &str, identity: &str, public_key: &str) -> WireRequest {
    let (nonce, auth_hmac) = signed_nonce(secret, identity);
    WireRequest::Handshake {
        identity: identity.to_string(),
        public_key: public_key.to_string(),
        protocol_version: PROTOCOL_VERSION,
        nonce,
        auth_hmac,
    }
}

/// Build the node's acknowledgement.
pub fn node_ack(secret: &str, identity: &str) -> WireResponse {
    let (nonce, auth_hmac) = signed_nonce(secret, identity);
    WireResponse::HandshakeAck {
        identity: identity.to_string(),
        protocol_version: PROTOCOL_VERSION,
        nonce,
        auth_hmac,
    }
}

/// Check the version and signature of either handshake direction.
pub fn verify(
    secret: &str,
    identity: &str,
    protocol_version: u32,
    nonce: &str,
    auth_hmac: &str,
) -> Result<(), WireError> {
    if protocol_version != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: protocol_version,
        });
    }
    if !hmac_verify(secret, format!("{nonce}{identity}").as_bytes(), auth_hmac) {
        return Err(WireError::HandshakeFailed(format!(
            "HMAC verification failed for {identity}"
        )));
    }
    Ok(())
}
