//! Bearer credential verification
//!
//! Control-plane tokens are `base64url(payload).base64url(signature)`
//! where the payload is `principal_id:role:expires_at_ms` and the
//! signature is HMAC-SHA256 over the payload bytes. Verification is
//! purely local; the `UserDirectory` collaborator is then consulted to
//! confirm the account is still active and not banned.
//!
//! Credential contents are never logged; rejections carry only the
//! failure class.

use crate::error::{ControlError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Platform role carried in a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Platform owner, the only role admitted to the control plane
    Owner,
    /// Store staff
    Staff,
    /// Regular customer
    Customer,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Staff => "staff",
            Role::Customer => "customer",
        }
    }

    fn parse(s: &str) -> Option<Role> {
        match s {
            "owner" => Some(Role::Owner),
            "staff" => Some(Role::Staff),
            "customer" => Some(Role::Customer),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verified caller identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable principal identifier
    pub id: String,
    /// Verified role
    pub role: Role,
}

/// Directory record for a principal, as reported by the user service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub id: String,
    pub role: Role,
    pub active: bool,
    pub banned: bool,
}

/// User directory collaborator: lookup by id, role and status checks
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// Fetch the directory entry for a principal, if one exists
    async fn lookup(&self, principal_id: &str) -> Result<Option<DirectoryEntry>>;
}

/// Verifies signed bearer credentials for control-plane access
pub struct TokenValidator {
    secret: Vec<u8>,
    directory: Arc<dyn UserDirectory>,
}

impl TokenValidator {
    /// Create a validator from a signing secret and a user directory
    pub fn new(secret: impl Into<Vec<u8>>, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            secret: secret.into(),
            directory,
        }
    }

    /// Verify a credential and return the caller's identity.
    ///
    /// Rejects malformed, tampered, expired, and non-owner tokens, and
    /// any principal the directory reports as missing, inactive, or
    /// banned, all before a session is created.
    pub async fn verify(&self, credential: &str) -> Result<Principal> {
        let payload = self.split_and_check_signature(credential)?;

        let mut parts = payload.splitn(3, ':');
        let (id, role, expires) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(role), Some(exp)) if !id.is_empty() => (id, role, exp),
            _ => return Err(ControlError::Authentication("malformed token".to_string())),
        };

        let expires_at: i64 = expires
            .parse()
            .map_err(|_| ControlError::Authentication("malformed token".to_string()))?;
        if chrono::Utc::now().timestamp_millis() >= expires_at {
            return Err(ControlError::Authentication("token expired".to_string()));
        }

        let role = Role::parse(role)
            .ok_or_else(|| ControlError::Authentication("malformed token".to_string()))?;
        if role != Role::Owner {
            return Err(ControlError::Authentication(
                "insufficient role".to_string(),
            ));
        }

        let entry = self
            .directory
            .lookup(id)
            .await?
            .ok_or_else(|| ControlError::Authentication("unknown principal".to_string()))?;
        if entry.banned || !entry.active {
            return Err(ControlError::Authentication(
                "principal suspended".to_string(),
            ));
        }
        if entry.role != Role::Owner {
            return Err(ControlError::Authentication(
                "insufficient role".to_string(),
            ));
        }

        Ok(Principal {
            id: id.to_string(),
            role,
        })
    }

    /// Issue a signed token. Intended for tests and operator tooling.
    pub fn issue(&self, principal_id: &str, role: Role, expires_at_ms: i64) -> String {
        let payload = format!("{}:{}:{}", principal_id, role.as_str(), expires_at_ms);
        let sig = self.sign(payload.as_bytes());
        format!("{}.{}", BASE64.encode(payload.as_bytes()), BASE64.encode(sig))
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    fn split_and_check_signature(&self, credential: &str) -> Result<String> {
        let (payload_b64, sig_b64) = credential
            .split_once('.')
            .ok_or_else(|| ControlError::Authentication("malformed token".to_string()))?;

        let payload = BASE64
            .decode(payload_b64)
            .map_err(|_| ControlError::Authentication("malformed token".to_string()))?;
        let signature = BASE64
            .decode(sig_b64)
            .map_err(|_| ControlError::Authentication("malformed token".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| ControlError::Authentication("invalid signature".to_string()))?;

        String::from_utf8(payload)
            .map_err(|_| ControlError::Authentication("malformed token".to_string()))
    }
}

/// In-memory user directory for testing and single-process use
#[derive(Default)]
pub struct MemoryDirectory {
    entries: tokio::sync::RwLock<std::collections::HashMap<String, DirectoryEntry>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory containing a single active owner
    pub fn with_owner(id: &str) -> Self {
        let mut entries = std::collections::HashMap::new();
        entries.insert(
            id.to_string(),
            DirectoryEntry {
                id: id.to_string(),
                role: Role::Owner,
                active: true,
                banned: false,
            },
        );
        Self {
            entries: tokio::sync::RwLock::new(entries),
        }
    }

    /// Insert or replace an entry
    pub async fn insert(&self, entry: DirectoryEntry) {
        self.entries.write().await.insert(entry.id.clone(), entry);
    }
}

#[async_trait::async_trait]
impl UserDirectory for MemoryDirectory {
    async fn lookup(&self, principal_id: &str) -> Result<Option<DirectoryEntry>> {
        Ok(self.entries.read().await.get(principal_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(directory: MemoryDirectory) -> TokenValidator {
        TokenValidator::new(b"test-signing-secret".to_vec(), Arc::new(directory))
    }

    fn future_ms() -> i64 {
        chrono::Utc::now().timestamp_millis() + 60_000
    }

    #[tokio::test]
    async fn test_valid_owner_token() {
        let v = validator(MemoryDirectory::with_owner("owner-1"));
        let token = v.issue("owner-1", Role::Owner, future_ms());

        let principal = v.verify(&token).await.unwrap();
        assert_eq!(principal.id, "owner-1");
        assert_eq!(principal.role, Role::Owner);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let v = validator(MemoryDirectory::with_owner("owner-1"));
        let token = v.issue("owner-1", Role::Owner, chrono::Utc::now().timestamp_millis() - 1);

        let err = v.verify(&token).await.unwrap_err();
        assert!(matches!(err, ControlError::Authentication(_)));
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_non_owner_role_rejected() {
        let dir = MemoryDirectory::with_owner("owner-1");
        dir.insert(DirectoryEntry {
            id: "staff-1".to_string(),
            role: Role::Staff,
            active: true,
            banned: false,
        })
        .await;
        let v = validator(dir);
        let token = v.issue("staff-1", Role::Staff, future_ms());

        let err = v.verify(&token).await.unwrap_err();
        assert!(err.to_string().contains("insufficient role"));
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let v = validator(MemoryDirectory::with_owner("owner-1"));
        let token = v.issue("owner-1", Role::Owner, future_ms());
        let mut tampered = token[..token.len() - 2].to_string();
        tampered.push_str("xx");

        assert!(v.verify(&tampered).await.is_err());
    }

    #[tokio::test]
    async fn test_forged_payload_rejected() {
        let v = validator(MemoryDirectory::with_owner("owner-1"));
        let token = v.issue("owner-1", Role::Owner, future_ms());
        let (_, sig) = token.split_once('.').unwrap();

        // Re-use a real signature with a different payload
        let forged_payload = BASE64.encode(format!("owner-2:owner:{}", future_ms()));
        let forged = format!("{}.{}", forged_payload, sig);

        let err = v.verify(&forged).await.unwrap_err();
        assert!(err.to_string().contains("invalid signature"));
    }

    #[tokio::test]
    async fn test_malformed_token_rejected() {
        let v = validator(MemoryDirectory::with_owner("owner-1"));
        for garbage in ["", "no-dot-here", "a.b", "!!!.???"] {
            assert!(v.verify(garbage).await.is_err(), "accepted: {garbage}");
        }
    }

    #[tokio::test]
    async fn test_banned_principal_rejected_despite_valid_token() {
        let dir = MemoryDirectory::with_owner("owner-1");
        dir.insert(DirectoryEntry {
            id: "owner-1".to_string(),
            role: Role::Owner,
            active: true,
            banned: true,
        })
        .await;
        let v = validator(dir);
        let token = v.issue("owner-1", Role::Owner, future_ms());

        let err = v.verify(&token).await.unwrap_err();
        assert!(err.to_string().contains("suspended"));
    }

    #[tokio::test]
    async fn test_unknown_principal_rejected() {
        let v = validator(MemoryDirectory::with_owner("owner-1"));
        let token = v.issue("ghost", Role::Owner, future_ms());

        let err = v.verify(&token).await.unwrap_err();
        assert!(err.to_string().contains("unknown principal"));
    }
}
