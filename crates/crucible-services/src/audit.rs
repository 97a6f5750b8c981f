//! Post-terminal side-effect hooks: usage increment and the audit log.
//!
//! These run after the write-once terminal transition. A hook failure is
//! logged and dropped; it never reverts job status. The write-once
//! transition upstream is what bounds the audit log to at most one
//! success entry per job.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;

use crucible_core::JobError;

use crate::directory::Directory;

/// One audit row, as read back by operators and tests.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub job_id: String,
    pub user_id: String,
    pub action: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditHooks {
    conn: Connection,
    directory: Directory,
}

impl AuditHooks {
    pub fn new(conn: Connection, directory: Directory) -> Self {
        Self { conn, directory }
    }

    /// Deploy succeeded: burn one unit of quota and leave a success row.
    pub async fn record_deploy_success(&self, user_id: &str, job_id: &str, contract_id: &str) {
        if let Err(e) = self.directory.increment_deploy_count(user_id).await {
            tracing::warn!(user_id, job_id, error = %e, "deploy counter increment failed");
        }
        if let Err(e) = self
            .insert(job_id, user_id, "deploy", "success", Some(contract_id))
            .await
        {
            tracing::warn!(user_id, job_id, error = %e, "audit success entry failed");
        }
    }

    /// Deploy failed: audit row only, no quota burn.
    pub async fn record_deploy_failure(&self, user_id: &str, job_id: &str, error: &str) {
        if let Err(e) = self
            .insert(job_id, user_id, "deploy", "failure", Some(error))
            .await
        {
            tracing::warn!(user_id, job_id, error = %e, "audit failure entry failed");
        }
    }

    async fn insert(
        &self,
        job_id: &str,
        user_id: &str,
        action: &str,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<(), JobError> {
        let job_id = job_id.to_string();
        let user_id = user_id.to_string();
        let action = action.to_string();
        let outcome = outcome.to_string();
        let detail = detail.map(String::from);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO audit_log (job_id, user_id, action, outcome, detail, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![job_id, user_id, action, outcome, detail, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| JobError::Transient(format!("audit: {e}")))
    }

    /// All rows for one job, oldest first.
    pub async fn entries_for_job(&self, job_id: &str) -> Result<Vec<AuditEntry>, JobError> {
        let job_id = job_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_id, user_id, action, outcome, detail, created_at
                     FROM audit_log WHERE job_id = ?1 ORDER BY seq",
                )?;
                let rows = stmt.query_map(params![job_id], |row| {
                    let created: String = row.get(5)?;
                    Ok(AuditEntry {
                        job_id: row.get(0)?,
                        user_id: row.get(1)?,
                        action: row.get(2)?,
                        outcome: row.get(3)?,
                        detail: row.get(4)?,
                        created_at: DateTime::parse_from_rfc3339(&created)
                            .map(|t| t.with_timezone(&Utc))
                            .map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(
                                    5,
                                    rusqlite::types::Type::Text,
                                    Box::new(e),
                                )
                            })?,
                    })
                })?;
                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row?);
                }
                Ok(entries)
            })
            .await
            .map_err(|e| JobError::Transient(format!("audit: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::open_store_in_memory;
    use crucible_core::user::Tier;

    #[tokio::test]
    async fn success_increments_and_records() {
        let conn = open_store_in_memory().await.unwrap();
        let dir = Directory::new(conn.clone());
        dir.upsert_user("u1", "tok", Tier::Free).await.unwrap();
        let hooks = AuditHooks::new(conn, dir.clone());

        hooks.record_deploy_success("u1", "j1", "CABC").await;

        let user = dir.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.deploy_counter.count, 1);

        let entries = hooks.entries_for_job("j1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "success");
        assert_eq!(entries[0].detail.as_deref(), Some("CABC"));
    }

    #[tokio::test]
    async fn failure_records_without_increment() {
        let conn = open_store_in_memory().await.unwrap();
        let dir = Directory::new(conn.clone());
        dir.upsert_user("u1", "tok", Tier::Free).await.unwrap();
        let hooks = AuditHooks::new(conn, dir.clone());

        hooks
            .record_deploy_failure("u1", "j1", "InvalidWasm: bad magic")
            .await;

        let user = dir.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.deploy_counter.count, 0);

        let entries = hooks.entries_for_job("j1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "failure");
    }

    #[tokio::test]
    async fn hooks_tolerate_unknown_user() {
        let conn = open_store_in_memory().await.unwrap();
        let dir = Directory::new(conn.clone());
        let hooks = AuditHooks::new(conn, dir);
        // No panic, no error surfaced.
        hooks.record_deploy_success("ghost", "j1", "CABC").await;
        assert_eq!(hooks.entries_for_job("j1").await.unwrap().len(), 1);
    }
}
