//! Admission for write requests: bearer token → credential → rate limit.
//!
//! The limiter is keyed by the resolved identity, never by the token, so a
//! rotated key shares its owner's window. The charge from a successful check
//! stands even if the handler later rejects the payload.

use crate::core::broker::{ANONYMOUS_ACTOR, DbBroker};
use crate::core::credential::{Credential, CredentialManager, CredentialStore};
use crate::core::error::AgentFeedError;
use crate::core::rate_limit::{RateLimitSnapshot, RateLimiter};

pub const BEARER_SCHEME: &str = "Bearer";
const OP_ADMISSION: &str = "admission.check";

/// A request that passed authentication and rate limiting.
#[derive(Debug, Clone)]
pub struct Admission {
    pub credential: Credential,
    pub rate_limit: RateLimitSnapshot,
}

impl Admission {
    pub fn identity_id(&self) -> &str {
        &self.credential.identity_id
    }
}

/// Token from an `Authorization` value of exactly `Bearer <token>`.
pub fn extract_bearer_token(header: Option<&str>) -> Option<&str> {
    let mut parts = header?.split(' ');
    let scheme = parts.next()?;
    let token = parts.next()?;
    if scheme != BEARER_SCHEME || token.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(token)
}

pub struct Authenticator<'a, S: CredentialStore> {
    credentials: &'a CredentialManager<S>,
    limiter: &'a RateLimiter,
    audit: Option<&'a DbBroker>,
}

impl<'a, S: CredentialStore> Authenticator<'a, S> {
    pub fn new(credentials: &'a CredentialManager<S>, limiter: &'a RateLimiter) -> Self {
        Self {
            credentials,
            limiter,
            audit: None,
        }
    }

    pub fn with_audit(mut self, broker: &'a DbBroker) -> Self {
        self.audit = Some(broker);
        self
    }

    fn log(
        &self,
        actor: &str,
        status: &str,
        detail: serde_json::Value,
    ) -> Result<(), AgentFeedError> {
        match self.audit {
            Some(broker) => broker.record(actor, OP_ADMISSION, status, Some(detail)),
            None => Ok(()),
        }
    }

    /// Admit or reject a write request given its `Authorization` value.
    pub fn admit(&self, authorization: Option<&str>) -> Result<Admission, AgentFeedError> {
        let Some(token) = extract_bearer_token(authorization) else {
            self.log(
                ANONYMOUS_ACTOR,
                "unauthenticated",
                serde_json::json!({ "reason": "missing or malformed authorization header" }),
            )?;
            return Err(AgentFeedError::Unauthenticated);
        };

        let Some(credential) = self.credentials.resolve(token)? else {
            self.log(
                ANONYMOUS_ACTOR,
                "unauthenticated",
                serde_json::json!({ "reason": "unknown or expired key" }),
            )?;
            return Err(AgentFeedError::Unauthenticated);
        };

        let snapshot = self.limiter.check(&credential.identity_id)?;
        if !snapshot.allowed {
            self.log(
                &credential.identity_id,
                "throttled",
                serde_json::json!({ "retry_after_secs": snapshot.retry_after_secs }),
            )?;
            return Err(AgentFeedError::Throttled(snapshot));
        }

        self.log(
            &credential.identity_id,
            "admitted",
            serde_json::json!({ "remaining": snapshot.remaining }),
        )?;
        Ok(Admission {
            credential,
            rate_limit: snapshot,
        })
    }
}
