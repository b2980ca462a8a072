//! Stateless CSRF tokens for the opinion form.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_CSRF_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
#[error("secret key cannot be used for HMAC-SHA256")]
pub struct InvalidSecret;

/// Issues and checks `<nonce>.<issued_at>.<signature>` tokens, where the
/// signature is HMAC-SHA256 over `<nonce>.<issued_at>` keyed by the app secret.
#[derive(Clone)]
pub struct CsrfGuard {
    mac: HmacSha256,
    max_age: Duration,
}

impl fmt::Debug for CsrfGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfGuard")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl CsrfGuard {
    pub fn new(secret: &str) -> Result<Self, InvalidSecret> {
        let mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| InvalidSecret)?;
        Ok(Self {
            mac,
            max_age: DEFAULT_CSRF_MAX_AGE,
        })
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn issue(&self) -> String {
        self.issue_at(Utc::now())
    }

    pub fn verify(&self, token: &str) -> bool {
        self.verify_at(token, Utc::now())
    }

    fn issue_at(&self, now: DateTime<Utc>) -> String {
        let payload = format!("{}.{}", Uuid::new_v4().simple(), now.timestamp());
        let signature = hex::encode(self.signer(&payload).finalize().into_bytes());
        format!("{payload}.{signature}")
    }

    fn verify_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        let Some((payload, signature)) = token.rsplit_once('.') else {
            return false;
        };
        let Some((nonce, issued_at)) = payload.split_once('.') else {
            return false;
        };
        if nonce.is_empty() {
            return false;
        }
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        if self.signer(payload).verify_slice(&signature).is_err() {
            return false;
        }
        let Ok(issued_at) = issued_at.parse::<i64>() else {
            return false;
        };
        // tokens from the future are rejected along with expired ones
        now.timestamp()
            .checked_sub(issued_at)
            .and_then(|age| u64::try_from(age).ok())
            .is_some_and(|age| age <= self.max_age.as_secs())
    }

    fn signer(&self, payload: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> CsrfGuard {
        CsrfGuard::new("secret").unwrap()
    }

    #[test]
    fn issued_tokens_verify() {
        let guard = guard();
        let token = guard.issue();
        assert!(guard.verify(&token));
        assert_ne!(token, guard.issue());
    }

    #[test]
    fn forged_or_foreign_tokens_fail() {
        let guard = guard();
        let other = CsrfGuard::new("another secret").unwrap();
        assert!(!guard.verify(&other.issue()));
        assert!(!guard.verify(""));
        assert!(!guard.verify("nonce-only"));
        assert!(!guard.verify("nonce.signature"));

        let token = guard.issue();
        let (payload, _) = token.rsplit_once('.').unwrap();
        assert!(!guard.verify(&format!("{payload}.{}", "0".repeat(64))));
        assert!(!guard.verify(&format!("x{token}")));
    }

    #[test]
    fn tokens_expire_after_max_age() {
        let guard = guard().with_max_age(Duration::from_secs(60));
        let issued = Utc::now();
        let token = guard.issue_at(issued);

        assert!(guard.verify_at(&token, issued + chrono::Duration::seconds(60)));
        assert!(!guard.verify_at(&token, issued + chrono::Duration::seconds(61)));
        assert!(!guard.verify_at(&token, issued - chrono::Duration::seconds(5)));
    }

    #[test]
    fn rewriting_the_issue_time_breaks_the_signature() {
        let guard = guard().with_max_age(Duration::from_secs(60));
        let issued = Utc::now() - chrono::Duration::hours(2);
        let token = guard.issue_at(issued);
        assert!(!guard.verify(&token));

        let mut parts = token.splitn(3, '.');
        let (nonce, _, signature) = (
            parts.next().unwrap(),
            parts.next().unwrap(),
            parts.next().unwrap(),
        );
        let refreshed = format!("{nonce}.{}.{signature}", Utc::now().timestamp());
        assert!(!guard.verify(&refreshed));
    }
}
