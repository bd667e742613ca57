use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use conductor_core::error::GuardError;
use conductor_core::policy::{ActionType, GuardDecision, RiskLevel};

pub const DEFAULT_APPROVAL_TTL_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Durable pause point: the decision context plus the serialized engine
/// state needed to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub comment: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub tool_name: String,
    pub action_hash: String,
    pub risk_level: RiskLevel,
    pub decision: GuardDecision,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub action_summary_redacted: String,
    #[serde(default, with = "base64_bytes")]
    pub resume_state: Vec<u8>,
}

impl ApprovalRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Generate the default approval id: `apr_` + 24 hex chars.
pub fn new_approval_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    format!("apr_{}", conductor_core::policy::hex_lower(&bytes))
}

/// Fill in creation defaults: id, created_at, five-minute TTL, pending
/// status.
pub fn with_creation_defaults(mut rec: ApprovalRecord, now: DateTime<Utc>) -> ApprovalRecord {
    if rec.id.trim().is_empty() {
        rec.id = new_approval_id();
    }
    if rec.created_at.timestamp() == 0 {
        rec.created_at = now;
    }
    if rec.expires_at <= rec.created_at {
        rec.expires_at = rec.created_at + Duration::seconds(DEFAULT_APPROVAL_TTL_SECS);
    }
    rec.status = ApprovalStatus::Pending;
    rec
}

/// Pure CRUD over approval records. All mutations are single-row; a
/// pending record resolves to approved or denied exactly once.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(&self, record: ApprovalRecord) -> Result<String, GuardError>;

    async fn get(&self, id: &str) -> Result<Option<ApprovalRecord>, GuardError>;

    async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        actor: &str,
        comment: &str,
    ) -> Result<(), GuardError>;
}

/// In-memory store for tests and store-less embedding.
#[derive(Default)]
pub struct MemoryApprovalStore {
    records: Mutex<HashMap<String, ApprovalRecord>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn create(&self, record: ApprovalRecord) -> Result<String, GuardError> {
        let record = with_creation_defaults(record, Utc::now());
        let id = record.id.clone();
        self.records
            .lock()
            .expect("records lock")
            .insert(id.clone(), record);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<ApprovalRecord>, GuardError> {
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .get(id.trim())
            .cloned())
    }

    async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        actor: &str,
        comment: &str,
    ) -> Result<(), GuardError> {
        if !matches!(status, ApprovalStatus::Approved | ApprovalStatus::Denied) {
            return Err(GuardError::Store(format!(
                "invalid resolution status: {}",
                status.as_str()
            )));
        }
        let mut records = self.records.lock().expect("records lock");
        let record = records
            .get_mut(id.trim())
            .ok_or_else(|| GuardError::ApprovalNotFound { id: id.to_string() })?;
        if record.status != ApprovalStatus::Pending {
            return Err(GuardError::AlreadyResolved {
                id: id.to_string(),
                status: record.status.as_str().to_string(),
            });
        }
        record.status = status;
        record.actor = actor.trim().to_string();
        record.comment = comment.trim().to_string();
        record.resolved_at = Some(Utc::now());
        Ok(())
    }
}
