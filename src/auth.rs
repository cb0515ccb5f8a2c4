//! Authentication plugins and the request-payload verification they apply.
//!
//! Authentication resolves two values per request before the core runs: the
//! expected AAD the request payload must carry, and the session key under
//! which the caller's events are stored. Both travel as an [`AuthData`]
//! request extension installed by [`auth_middleware`].

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::types::{Error, ErrorCode};

/// Session key generated and provided by the client.
pub const SESSION_KEY_HEADER: &str = "x-txgate-session-key";
/// AAD header read by the development-only insecure plugin.
pub const INSECURE_AUTH_HEADER: &str = "x-txgate-insecure-auth";
/// AAD header read by the sealed-payload plugin.
pub const SEALED_AAD_HEADER: &str = "x-txgate-aad";

/// Per-request authentication context consumed by the service handlers.
#[derive(Debug, Clone)]
pub struct AuthData {
    /// AAD the request payload must prove knowledge of.
    pub expected_aad: String,
    /// Subscription key the caller's events are stored under.
    pub session_key: String,
}

/// An authentication plugin.
///
/// `authenticate` runs once per request in the middleware; `verify` runs in
/// the service handlers against the transaction payload itself.
pub trait Auth: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn authenticate(&self, headers: &HeaderMap) -> Result<String, Error>;
    fn verify(&self, data: &str, expected_aad: &str) -> Result<(), Error>;
}

/// Header-based plugin for development and testing. Trusts the caller to
/// state its own AAD; never deploy it against real users.
pub struct InsecureAuth;

impl Auth for InsecureAuth {
    fn name(&self) -> &'static str {
        "auth.insecure"
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<String, Error> {
        headers
            .get(INSECURE_AUTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::new(ErrorCode::PayloadDataTooShort))
    }

    fn verify(&self, data: &str, _expected_aad: &str) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::new(ErrorCode::PayloadDataTooShort));
        }
        Ok(())
    }
}

/// Plugin for sealed request payloads: the transaction data embeds the AAD,
/// and it must match the AAD the caller authenticated with.
pub struct SealedAuth;

impl Auth for SealedAuth {
    fn name(&self) -> &'static str {
        "auth.sealed"
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<String, Error> {
        headers
            .get(SEALED_AAD_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::new(ErrorCode::MissingData))
    }

    fn verify(&self, data: &str, expected_aad: &str) -> Result<(), Error> {
        verify_sealed_payload(data.as_bytes(), expected_aad)
    }
}

pub fn from_config(cfg: &crate::config::AuthConfig) -> Arc<dyn Auth> {
    match cfg.provider {
        crate::config::AuthProvider::Insecure => Arc::new(InsecureAuth),
        crate::config::AuthProvider::Sealed => Arc::new(SealedAuth),
    }
}

const PUBLIC_KEY_LEN: usize = 16;
const LENGTHS_LEN: usize = 16;
const NONCE_LEN: usize = 5;

/// Checks a sealed payload against the expected AAD.
///
/// Layout: `pk(16) || cipher_len(u64 BE) || aad_len(u64 BE) || cipher ||
/// aad || nonce(5)`. The cipher itself is opaque to the gateway; only the
/// framing and the AAD are checked here.
pub fn verify_sealed_payload(data: &[u8], expected_aad: &str) -> Result<(), Error> {
    if data.len() < PUBLIC_KEY_LEN + LENGTHS_LEN {
        return Err(Error::new(ErrorCode::PayloadDataTooShort));
    }

    let mut cipher_len = [0u8; 8];
    cipher_len.copy_from_slice(&data[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + 8]);
    let cipher_len = u64::from_be_bytes(cipher_len) as usize;

    let mut aad_len = [0u8; 8];
    aad_len.copy_from_slice(&data[PUBLIC_KEY_LEN + 8..PUBLIC_KEY_LEN + 16]);
    let aad_len = u64::from_be_bytes(aad_len) as usize;

    let body = &data[PUBLIC_KEY_LEN + LENGTHS_LEN..];
    let expected_body_len = cipher_len
        .checked_add(aad_len)
        .and_then(|len| len.checked_add(NONCE_LEN))
        .ok_or_else(|| Error::new(ErrorCode::MissingData))?;
    if body.len() < expected_body_len {
        return Err(Error::new(ErrorCode::MissingData));
    }

    let aad = &body[cipher_len..cipher_len + aad_len];
    if aad != expected_aad.as_bytes() {
        return Err(Error::new(ErrorCode::AadMismatch));
    }

    Ok(())
}

/// Axum middleware guarding the public router.
///
/// Resolves the expected AAD through the configured plugin, requires the
/// client-provided session key header, and installs [`AuthData`] for the
/// handlers. Failures are terminal 403s; no detail leaks to the caller.
pub async fn auth_middleware(
    State(auth): State<Arc<dyn Auth>>,
    mut request: Request,
    next: Next,
) -> Response {
    let expected_aad = match auth.authenticate(request.headers()) {
        Ok(aad) => aad,
        Err(err) => {
            tracing::debug!(provider = auth.name(), error = %err, "authentication rejected");
            return StatusCode::FORBIDDEN.into_response();
        }
    };

    let session_key = match request
        .headers()
        .get(SESSION_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        Some(key) => key.to_string(),
        None => return StatusCode::FORBIDDEN.into_response(),
    };

    request.extensions_mut().insert(AuthData {
        expected_aad,
        session_key,
    });
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPECTED_AAD: &str = "expectedAAD";

    fn sealed_payload(pk: &str, cipher: &str, aad: &str, nonce: &str) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(pk.as_bytes());
        data.extend_from_slice(&(cipher.len() as u64).to_be_bytes());
        data.extend_from_slice(&(aad.len() as u64).to_be_bytes());
        data.extend_from_slice(cipher.as_bytes());
        data.extend_from_slice(aad.as_bytes());
        data.extend_from_slice(nonce.as_bytes());
        data
    }

    fn payload() -> Vec<u8> {
        sealed_payload(&"0".repeat(16), &"0".repeat(32), EXPECTED_AAD, &"0".repeat(5))
    }

    #[test]
    fn verify_ok() {
        assert!(verify_sealed_payload(&payload(), EXPECTED_AAD).is_ok());
    }

    #[test]
    fn verify_missing_lengths() {
        let err = verify_sealed_payload(&payload()[..28], EXPECTED_AAD).unwrap_err();
        assert_eq!(err.description, "Payload data is too short.");
    }

    #[test]
    fn verify_missing_nonce() {
        let data = payload();
        let err = verify_sealed_payload(&data[..data.len() - 5], EXPECTED_AAD).unwrap_err();
        assert_eq!(err.description, "Missing data.");
    }

    #[test]
    fn verify_mismatched_aad() {
        let err = verify_sealed_payload(&payload(), "wrongAAD").unwrap_err();
        assert_eq!(err.description, "AAD does not match.");
    }

    #[test]
    fn insecure_auth_requires_header() {
        let mut headers = HeaderMap::new();
        assert!(InsecureAuth.authenticate(&headers).is_err());

        headers.insert(INSECURE_AUTH_HEADER, "some-aad".parse().unwrap());
        assert_eq!(InsecureAuth.authenticate(&headers).unwrap(), "some-aad");
    }
}
