use crate::models::ApiError;
use axum::{
    Json,
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{convert::Infallible, sync::Arc};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Line-Signature";
const SIGNATURE_HEADER_ALIAS: &str = "X-Signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid,
}

/// What to do with requests when no channel secret is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsignedPolicy {
    /// Debug escape hatch: every request passes.
    Accept,
    Reject,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<Arc<[u8]>>,
    unsigned: UnsignedPolicy,
}

impl SignatureVerifier {
    pub fn new(secret: Option<&str>, unsigned: UnsignedPolicy) -> Self {
        let secret = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Arc::from(s.as_bytes()));
        if secret.is_none() {
            match unsigned {
                UnsignedPolicy::Accept => warn!(
                    target = "intake.webhook",
                    "no channel secret configured and WEBHOOK_ALLOW_UNSIGNED is set; signature checks are disabled"
                ),
                UnsignedPolicy::Reject => warn!(
                    target = "intake.webhook",
                    "no channel secret configured; every webhook delivery will be rejected"
                ),
            }
        }
        Self { secret, unsigned }
    }

    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Verification {
        let Some(secret) = &self.secret else {
            return match self.unsigned {
                UnsignedPolicy::Accept => Verification::Valid,
                UnsignedPolicy::Reject => Verification::Invalid,
            };
        };
        let Some(presented) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
            return Verification::Invalid;
        };
        let Ok(expected) = BASE64.decode(presented) else {
            return Verification::Invalid;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
            return Verification::Invalid;
        };
        mac.update(body);
        // verify_slice compares in constant time
        match mac.verify_slice(&expected) {
            Ok(()) => Verification::Valid,
            Err(_) => Verification::Invalid,
        }
    }
}

#[derive(Clone)]
pub struct SignatureState {
    pub verifier: SignatureVerifier,
    pub body_limit: usize,
}

pub async fn require_signature(
    State(state): State<SignatureState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, state.body_limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Ok(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "body_too_large",
                "Request body exceeds limit",
            ));
        }
    };

    let presented = signature_header(&parts.headers);
    if state.verifier.verify(&bytes, presented) == Verification::Invalid {
        warn!(
            target = "intake.webhook",
            has_signature = presented.is_some(),
            body_len = bytes.len(),
            "webhook signature rejected"
        );
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "Signature verification failed",
        ));
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SIGNATURE_HEADER)
        .or_else(|| headers.get(SIGNATURE_HEADER_ALIAS))
        .and_then(|value| value.to_str().ok())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

#[cfg(test)]
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(body);
    BASE64.encode(mac.finalize().into_bytes())
}
