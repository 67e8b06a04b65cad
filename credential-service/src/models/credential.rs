//! Credential record model for the provider credential pool.

use chrono::{DateTime, Duration, Utc};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Number of plaintext characters kept for display.
pub const SECRET_PREFIX_LEN: usize = 8;

/// Secrets shorter than this only reveal a very short prefix.
const SHORT_SECRET_LEN: usize = 12;
const SHORT_SECRET_PREFIX_LEN: usize = 3;

/// Upstream API provider a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    ElevenLabs,
}

impl Provider {
    /// Convert from proto enum value.
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::OpenAi),
            2 => Some(Self::Anthropic),
            3 => Some(Self::Google),
            4 => Some(Self::ElevenLabs),
            _ => None,
        }
    }

    /// Convert to proto enum value.
    pub fn to_proto(self) -> i32 {
        match self {
            Self::OpenAi => 1,
            Self::Anthropic => 2,
            Self::Google => 3,
            Self::ElevenLabs => 4,
        }
    }

    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::ElevenLabs => "elevenlabs",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "google" => Ok(Self::Google),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(format!("Invalid provider: {}", other)),
        }
    }
}

/// Cost bracket of a credential. Declared from most to least expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Premium,
    Standard,
    Fallback,
}

impl Tier {
    /// Every tier, in the order a cap-exceeded rotation walks them.
    pub const ALL: [Tier; 3] = [Tier::Premium, Tier::Standard, Tier::Fallback];

    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Premium),
            2 => Some(Self::Standard),
            3 => Some(Self::Fallback),
            _ => None,
        }
    }

    pub fn to_proto(self) -> i32 {
        match self {
            Self::Premium => 1,
            Self::Standard => 2,
            Self::Fallback => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Premium => "premium",
            Self::Standard => "standard",
            Self::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a credential. `Revoked` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Pending,
    Active,
    Inactive,
    Revoked,
}

impl CredentialStatus {
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Active),
            3 => Some(Self::Inactive),
            4 => Some(Self::Revoked),
            _ => None,
        }
    }

    pub fn to_proto(self) -> i32 {
        match self {
            Self::Pending => 1,
            Self::Active => 2,
            Self::Inactive => 3,
            Self::Revoked => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Revoked => "revoked",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Revoked
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored provider credential. `secret` is ciphertext.
#[derive(Clone, FromRow, Serialize)]
pub struct Credential {
    pub credential_id: Uuid,
    pub provider: Provider,
    pub tier: Tier,
    pub label: String,
    #[serde(skip_serializing)]
    pub secret: Vec<u8>,
    pub secret_prefix: String,
    pub status: CredentialStatus,
    pub usage_count: i64,
    pub last_used_utc: Option<DateTime<Utc>>,
    pub activated_utc: Option<DateTime<Utc>>,
    pub deactivated_utc: Option<DateTime<Utc>>,
    pub added_utc: DateTime<Utc>,
    pub added_by: Option<Uuid>,
    pub notes: Option<String>,
}

impl Credential {
    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    /// Display form of the secret, safe for logs and the audit trail.
    pub fn masked(&self) -> String {
        mask_prefix(&self.secret_prefix)
    }

    /// Whether the credential was activated less than `window` before `now`.
    pub fn activated_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.activated_utc {
            Some(activated) => now - activated < window,
            None => false,
        }
    }
}

// Hand-written so ciphertext never ends up in logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("credential_id", &self.credential_id)
            .field("provider", &self.provider)
            .field("tier", &self.tier)
            .field("label", &self.label)
            .field("secret", &self.masked())
            .field("status", &self.status)
            .field("usage_count", &self.usage_count)
            .field("activated_utc", &self.activated_utc)
            .field("added_utc", &self.added_utc)
            .finish_non_exhaustive()
    }
}

/// Input for adding a credential to the pool.
#[derive(Debug, Validate)]
pub struct NewCredential {
    pub provider: Provider,
    pub tier: Tier,
    #[validate(length(min = 1, max = 200, message = "label must be 1-200 characters"))]
    pub label: String,
    pub secret: Secret<String>,
    pub added_by: Option<Uuid>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

/// Optional filters for listing credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialFilter {
    pub provider: Option<Provider>,
    pub tier: Option<Tier>,
    pub status: Option<CredentialStatus>,
}

/// First characters of a plaintext secret, kept for display only.
pub fn secret_prefix(plaintext: &str) -> String {
    let len = plaintext.chars().count();
    let keep = if len < SHORT_SECRET_LEN {
        SHORT_SECRET_PREFIX_LEN.min(len)
    } else {
        SECRET_PREFIX_LEN
    };
    plaintext.chars().take(keep).collect()
}

pub fn mask_prefix(prefix: &str) -> String {
    format!("{}...****", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(status: CredentialStatus, activated_utc: Option<DateTime<Utc>>) -> Credential {
        Credential {
            credential_id: Uuid::new_v4(),
            provider: Provider::OpenAi,
            tier: Tier::Fallback,
            label: "fallback-1".to_string(),
            secret: vec![1, 2, 3],
            secret_prefix: "sk-proj-".to_string(),
            status,
            usage_count: 0,
            last_used_utc: None,
            activated_utc,
            deactivated_utc: None,
            added_utc: Utc::now(),
            added_by: None,
            notes: None,
        }
    }

    #[test]
    fn test_secret_prefix_keeps_eight_characters() {
        assert_eq!(secret_prefix("sk-ant-REDACTED"), "sk-ant-a");
    }

    #[test]
    fn test_short_secret_reveals_less() {
        assert_eq!(secret_prefix("abcdefgh"), "abc");
        assert_eq!(secret_prefix("ab"), "ab");
        assert_eq!(secret_prefix(""), "");
    }

    #[test]
    fn test_masked_never_contains_ciphertext() {
        let cred = credential(CredentialStatus::Active, None);
        assert_eq!(cred.masked(), "sk-proj-...****");
        let debug = format!("{:?}", cred);
        assert!(debug.contains("sk-proj-...****"));
        assert!(!debug.contains("[1, 2, 3]"));
    }

    #[test]
    fn test_activated_within_window() {
        let now = Utc::now();
        let recent = credential(
            CredentialStatus::Active,
            Some(now - Duration::seconds(120)),
        );
        let old = credential(
            CredentialStatus::Active,
            Some(now - Duration::seconds(7200)),
        );
        let never = credential(CredentialStatus::Pending, None);

        assert!(recent.activated_within(now, Duration::seconds(3600)));
        assert!(!old.activated_within(now, Duration::seconds(3600)));
        assert!(!never.activated_within(now, Duration::seconds(3600)));
    }

    #[test]
    fn test_only_revoked_is_terminal() {
        assert!(CredentialStatus::Revoked.is_terminal());
        assert!(!CredentialStatus::Inactive.is_terminal());
        assert!(!CredentialStatus::Pending.is_terminal());
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("OpenAI".parse::<Provider>(), Ok(Provider::OpenAi));
        assert_eq!(" anthropic ".parse::<Provider>(), Ok(Provider::Anthropic));
        assert!("azure".parse::<Provider>().is_err());
    }

    #[test]
    fn test_proto_values_reject_unspecified() {
        assert_eq!(Tier::from_proto(0), None);
        assert_eq!(Provider::from_proto(0), None);
        assert_eq!(CredentialStatus::from_proto(0), None);
        for tier in Tier::ALL {
            assert_eq!(Tier::from_proto(tier.to_proto()), Some(tier));
        }
    }
}
