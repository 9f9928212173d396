//! Credentials decoded from the platform's signed access token, plus the
//! pluggable token persistence port.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{OrganizationId, UserId},
    errors::Error,
    Result,
};

/// Access/refresh token pair as exchanged with the platform and token stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tokens {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Claims {
    #[serde(default)]
    user: Option<String>,
    #[serde(default, rename = "userId")]
    user_id: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    organization: Option<String>,
    #[serde(default, rename = "organizationId")]
    organization_id: Option<String>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    email: Option<String>,
}

/// Claims of the current access token.
///
/// The token's signature is not verified here; the platform does that on every
/// call. Decoding only extracts who we are and when the token lapses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthState {
    pub user_id: UserId,
    pub organization_id: Option<OrganizationId>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token: String,
    pub refresh_token: Option<String>,
    pub email: Option<String>,
}

impl AuthState {
    pub fn from_tokens(tokens: Tokens) -> Result<Self> {
        let claims = decode_claims(&tokens.token)?;
        let user = claims
            .user
            .or(claims.user_id)
            .or(claims.sub)
            .ok_or_else(|| Error::Auth("access token carries no user id".to_string()))?;

        Ok(Self {
            user_id: UserId(user),
            organization_id: claims
                .organization
                .or(claims.organization_id)
                .map(OrganizationId),
            issued_at: claims.iat.and_then(|s| DateTime::from_timestamp(s, 0)),
            expires_at: claims.exp.and_then(|s| DateTime::from_timestamp(s, 0)),
            token: tokens.token,
            refresh_token: tokens.refresh_token,
            email: claims.email,
        })
    }

    pub fn tokens(&self) -> Tokens {
        Tokens {
            token: self.token.clone(),
            refresh_token: self.refresh_token.clone(),
        }
    }

    /// Tokens without an `exp` claim never expire locally.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Identity sent as `clientId` when exchanging the refresh token.
    pub fn client_id(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.user_id.0)
    }
}

fn decode_claims(token: &str) -> Result<Claims> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| Error::Auth(format!("invalid access token: {e}")))
}

/// Shared credential cell.
///
/// Writers replace the whole state; readers clone the `Arc` at call time so a
/// request always carries the latest token.
#[derive(Debug)]
pub struct AuthCell {
    inner: RwLock<Arc<AuthState>>,
}

impl AuthCell {
    pub fn new(state: AuthState) -> Self {
        Self {
            inner: RwLock::new(Arc::new(state)),
        }
    }

    pub fn current(&self) -> Arc<AuthState> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, state: AuthState) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(state);
    }
}

/// Pluggable token persistence (e.g. a secrets backend shared by several
/// processes). The client consults it before exchanging a refresh token and
/// writes refreshed tokens back to it.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_tokens(&self) -> Result<Option<Tokens>>;
    async fn set_tokens(&self, tokens: &Tokens) -> Result<()>;
}

/// Process-local token store; the default when no external store is injected.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<Option<Tokens>>,
}

impl MemoryTokenStore {
    pub fn new(initial: Option<Tokens>) -> Self {
        Self {
            tokens: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get_tokens(&self) -> Result<Option<Tokens>> {
        Ok(self.tokens.lock().await.clone())
    }

    async fn set_tokens(&self, tokens: &Tokens) -> Result<()> {
        *self.tokens.lock().await = Some(tokens.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mint_token;

    #[test]
    fn decodes_claims_from_unverified_token() {
        let token = mint_token("u1", 1_700_000_000);
        let st = AuthState::from_tokens(Tokens {
            token: token.clone(),
            refresh_token: Some("r1".to_string()),
        })
        .unwrap();

        assert_eq!(st.user_id, UserId("u1".to_string()));
        assert_eq!(st.organization_id, Some(OrganizationId("org1".to_string())));
        assert_eq!(st.email.as_deref(), Some("u1@example.test"));
        assert_eq!(st.client_id(), "u1@example.test");
        assert_eq!(st.token, token);
        assert_eq!(
            st.expires_at,
            DateTime::from_timestamp(1_700_000_000 + 3600, 0)
        );
    }

    #[test]
    fn expiry_is_relative_to_now() {
        let st = AuthState::from_tokens(Tokens {
            token: mint_token("u1", 1_700_000_000),
            refresh_token: None,
        })
        .unwrap();
        let before = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let after = DateTime::from_timestamp(1_700_000_000 + 7200, 0).unwrap();
        assert!(!st.is_expired(before));
        assert!(st.is_expired(after));
    }

    #[test]
    fn garbage_token_is_an_auth_error() {
        let err = AuthState::from_tokens(Tokens {
            token: "not-a-jwt".to_string(),
            refresh_token: None,
        })
        .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn cell_replaces_whole_state() {
        let first = AuthState::from_tokens(Tokens {
            token: mint_token("u1", 1_700_000_000),
            refresh_token: None,
        })
        .unwrap();
        let cell = AuthCell::new(first);
        let held = cell.current();

        let second = AuthState::from_tokens(Tokens {
            token: mint_token("u1", 1_800_000_000),
            refresh_token: Some("r2".to_string()),
        })
        .unwrap();
        cell.replace(second.clone());

        assert_ne!(held.token, cell.current().token);
        assert_eq!(*cell.current(), second);
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryTokenStore::default();
        assert_eq!(store.get_tokens().await.unwrap(), None);
        let t = Tokens {
            token: "a".to_string(),
            refresh_token: Some("b".to_string()),
        };
        store.set_tokens(&t).await.unwrap();
        assert_eq!(store.get_tokens().await.unwrap(), Some(t));
    }
}
