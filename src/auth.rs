//! Inbound bearer-token auth for the `/v1` surface.
//!
//! Tokens come from the environment or a token file; storage and comparison
//! work on SHA-256 digests so raw tokens never sit in long-lived state and
//! comparisons don't leak length information about the configured secrets.
//! No tokens configured means auth is disabled.

use actix_web::body::BoxBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::web;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::Config;
use crate::error::unauthorized;
use crate::util::AppState;

fn digest_hex(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub struct AuthTokens {
    digests: Vec<String>,
    exclude: Vec<String>,
}

impl AuthTokens {
    pub fn from_config(config: &Config) -> Self {
        let digests = config
            .inbound_tokens()
            .iter()
            .map(|t| digest_hex(t))
            .collect();
        AuthTokens {
            digests,
            exclude: config.auth_exclude_list(),
        }
    }

    pub fn disabled() -> Self {
        AuthTokens {
            digests: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.digests.is_empty()
    }

    /// Paths under /v1 require a token, minus the configured exclusions.
    pub fn requires_auth(&self, path: &str) -> bool {
        if !self.enabled() || !path.starts_with("/v1/") {
            return false;
        }
        !self.exclude.iter().any(|x| path == x || path.starts_with(x))
    }

    pub fn verify(&self, token: &str) -> bool {
        let candidate = digest_hex(token);
        self.digests.iter().any(|d| d == &candidate)
    }

    /// Validate an `Authorization` header value.
    pub fn verify_header(&self, header: Option<&str>) -> bool {
        let Some(value) = header else {
            return false;
        };
        let value = value.trim();
        if value.len() < 7 || !value[..6].eq_ignore_ascii_case("bearer") {
            return false;
        }
        self.verify(value[6..].trim())
    }
}

/// Middleware guarding the /v1 surface.
pub async fn bearer_guard(
    req: ServiceRequest,
    next: Next<BoxBody>,
) -> Result<ServiceResponse<BoxBody>, actix_web::Error> {
    let verdict = req.app_data::<web::Data<AppState>>().map(|state| {
        if !state.auth.requires_auth(req.path()) {
            return Ok(());
        }
        let header = req
            .headers()
            .get(actix_web::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if state.auth.verify_header(header) {
            Ok(())
        } else if header.is_some() {
            Err(unauthorized("Invalid API token"))
        } else {
            Err(unauthorized("Missing Authorization bearer"))
        }
    });

    match verdict {
        Some(Err(err)) => {
            debug!("rejected {} {}: {err}", req.method(), req.path());
            Ok(req.into_response(actix_web::ResponseError::error_response(&err)))
        }
        _ => next.call(req).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(list: &[&str], exclude: &[&str]) -> AuthTokens {
        AuthTokens {
            digests: list.iter().map(|t| digest_hex(t)).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn disabled_auth_requires_nothing() {
        let auth = AuthTokens::disabled();
        assert!(!auth.requires_auth("/v1/chat/completions"));
    }

    #[test]
    fn v1_paths_guarded_with_exclusions() {
        let auth = tokens(&["secret"], &["/v1/models"]);
        assert!(auth.requires_auth("/v1/chat/completions"));
        assert!(!auth.requires_auth("/v1/models"));
        assert!(!auth.requires_auth("/health"));
        assert!(!auth.requires_auth("/api/model-capabilities"));
    }

    #[test]
    fn header_verification() {
        let auth = tokens(&["secret"], &[]);
        assert!(auth.verify_header(Some("Bearer secret")));
        assert!(auth.verify_header(Some("bearer   secret")));
        assert!(!auth.verify_header(Some("Bearer wrong")));
        assert!(!auth.verify_header(Some("Basic secret")));
        assert!(!auth.verify_header(None));
    }
}
