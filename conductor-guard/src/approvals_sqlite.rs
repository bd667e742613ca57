use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{prelude::FromRow, SqlitePool};

use conductor_core::error::GuardError;
use conductor_core::policy::{ActionType, GuardDecision, RiskLevel};

use crate::approvals::{with_creation_defaults, ApprovalRecord, ApprovalStatus, ApprovalStore};

#[derive(Clone)]
pub struct SqliteApprovalStore {
    pool: Arc<SqlitePool>,
}

#[derive(Debug, FromRow)]
struct ApprovalRow {
    id: String,
    run_id: String,
    created_at_unix: i64,
    expires_at_unix: i64,
    resolved_at_unix: Option<i64>,
    status: String,
    actor: String,
    comment: String,
    action_type: String,
    tool_name: String,
    action_hash: String,
    risk_level: String,
    decision: String,
    reasons_json: String,
    action_summary_redacted: String,
    resume_state: Vec<u8>,
}

impl SqliteApprovalStore {
    pub async fn open(path: &Path) -> Result<Self, GuardError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| GuardError::Store(err.to_string()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|err| GuardError::Store(format!("invalid sqlite options: {err}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|err| GuardError::Store(err.to_string()))?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, GuardError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|err| GuardError::Store(err.to_string()))?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), GuardError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guard_approvals (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                created_at_unix INTEGER NOT NULL,
                expires_at_unix INTEGER NOT NULL,
                resolved_at_unix INTEGER,
                status TEXT NOT NULL,
                actor TEXT NOT NULL DEFAULT '',
                comment TEXT NOT NULL DEFAULT '',
                action_type TEXT NOT NULL,
                tool_name TEXT NOT NULL DEFAULT '',
                action_hash TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                decision TEXT NOT NULL,
                reasons_json TEXT NOT NULL DEFAULT '[]',
                action_summary_redacted TEXT NOT NULL DEFAULT '',
                resume_state BLOB NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(|err| GuardError::Store(err.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_guard_approvals_status
            ON guard_approvals(status)
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(|err| GuardError::Store(err.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for SqliteApprovalStore {
    async fn create(&self, record: ApprovalRecord) -> Result<String, GuardError> {
        let record = with_creation_defaults(record, Utc::now());
        let reasons_json = serde_json::to_string(&record.reasons)
            .map_err(|err| GuardError::Store(err.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO guard_approvals (
                id, run_id, created_at_unix, expires_at_unix, resolved_at_unix,
                status, actor, comment,
                action_type, tool_name, action_hash,
                risk_level, decision, reasons_json,
                action_summary_redacted, resume_state
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.run_id.trim())
        .bind(record.created_at.timestamp())
        .bind(record.expires_at.timestamp())
        .bind(record.resolved_at.map(|t| t.timestamp()))
        .bind(record.status.as_str())
        .bind(record.actor.trim())
        .bind(record.comment.trim())
        .bind(record.action_type.as_str())
        .bind(record.tool_name.trim())
        .bind(record.action_hash.trim())
        .bind(risk_label(record.risk_level))
        .bind(decision_label(record.decision))
        .bind(reasons_json)
        .bind(record.action_summary_redacted.trim())
        .bind(&record.resume_state)
        .execute(self.pool.as_ref())
        .await
        .map_err(|err| GuardError::Store(err.to_string()))?;

        Ok(record.id)
    }

    async fn get(&self, id: &str) -> Result<Option<ApprovalRecord>, GuardError> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT
                id, run_id, created_at_unix, expires_at_unix, resolved_at_unix,
                status, actor, comment,
                action_type, tool_name, action_hash,
                risk_level, decision, reasons_json,
                action_summary_redacted, resume_state
            FROM guard_approvals
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|err| GuardError::Store(err.to_string()))?;

        row.map(parse_approval_row).transpose()
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
        let id = id.trim();
        if id.is_empty() {
            return Err(GuardError::MissingApprovalId);
        }

        let updated = sqlx::query(
            r#"
            UPDATE guard_approvals
            SET status = ?, actor = ?, comment = ?, resolved_at_unix = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(actor.trim())
        .bind(comment.trim())
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(ApprovalStatus::Pending.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(|err| GuardError::Store(err.to_string()))?;

        if updated.rows_affected() == 0 {
            return match self.get(id).await? {
                Some(existing) => Err(GuardError::AlreadyResolved {
                    id: id.to_string(),
                    status: existing.status.as_str().to_string(),
                }),
                None => Err(GuardError::ApprovalNotFound { id: id.to_string() }),
            };
        }
        Ok(())
    }
}

fn risk_label(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
        RiskLevel::Critical => "critical",
    }
}

fn decision_label(decision: GuardDecision) -> &'static str {
    match decision {
        GuardDecision::Allow => "allow",
        GuardDecision::AllowWithRedaction => "allow_with_redaction",
        GuardDecision::RequireApproval => "require_approval",
        GuardDecision::Deny => "deny",
    }
}

fn parse_approval_row(row: ApprovalRow) -> Result<ApprovalRecord, GuardError> {
    let status = ApprovalStatus::parse(&row.status)
        .ok_or_else(|| GuardError::Store(format!("unknown approval status '{}'", row.status)))?;
    let action_type = match row.action_type.as_str() {
        "ToolCallPre" => ActionType::ToolCallPre,
        "ToolCallPost" => ActionType::ToolCallPost,
        "OutputPublish" => ActionType::OutputPublish,
        "SkillInstall" => ActionType::SkillInstall,
        other => return Err(GuardError::Store(format!("unknown action type '{other}'"))),
    };
    let risk_level = match row.risk_level.as_str() {
        "low" => RiskLevel::Low,
        "medium" => RiskLevel::Medium,
        "high" => RiskLevel::High,
        "critical" => RiskLevel::Critical,
        other => return Err(GuardError::Store(format!("unknown risk level '{other}'"))),
    };
    let decision = match row.decision.as_str() {
        "allow" => GuardDecision::Allow,
        "allow_with_redaction" => GuardDecision::AllowWithRedaction,
        "require_approval" => GuardDecision::RequireApproval,
        "deny" => GuardDecision::Deny,
        other => return Err(GuardError::Store(format!("unknown decision '{other}'"))),
    };
    let reasons: Vec<String> = serde_json::from_str(&row.reasons_json).unwrap_or_default();

    Ok(ApprovalRecord {
        id: row.id,
        run_id: row.run_id,
        created_at: timestamp(row.created_at_unix)?,
        expires_at: timestamp(row.expires_at_unix)?,
        resolved_at: row.resolved_at_unix.map(timestamp).transpose()?,
        status,
        actor: row.actor,
        comment: row.comment,
        action_type,
        tool_name: row.tool_name,
        action_hash: row.action_hash,
        risk_level,
        decision,
        reasons,
        action_summary_redacted: row.action_summary_redacted,
        resume_state: row.resume_state,
    })
}

fn timestamp(unix: i64) -> Result<DateTime<Utc>, GuardError> {
    DateTime::from_timestamp(unix, 0)
        .ok_or_else(|| GuardError::Store(format!("invalid unix timestamp {unix}")))
}
