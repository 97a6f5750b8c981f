//! User and project directory — the boundary to the account system.
//!
//! The core consumes identity, tier, counters, and project bundles; it
//! owns none of them. This store-backed directory keeps API and worker
//! processes reading the same counters through the database of record.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;

use crucible_core::JobError;
use crucible_core::job::SourceFile;
use crucible_core::user::{ProjectRef, QuotaAction, Tier, UsageCounter, UserRef};

use crate::quota;

fn dir_err(e: tokio_rusqlite::Error) -> JobError {
    JobError::Transient(format!("directory: {e}"))
}

fn tier_from_str(s: &str) -> Tier {
    match s {
        "tier_mid" => Tier::TierMid,
        "tier_top" => Tier::TierTop,
        _ => Tier::Free,
    }
}

fn tier_str(tier: Tier) -> &'static str {
    match tier {
        Tier::Free => "free",
        Tier::TierMid => "tier_mid",
        Tier::TierTop => "tier_top",
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRef> {
    let tier_text: String = row.get("tier")?;
    let tier = tier_from_str(&tier_text);
    let parse = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    };
    Ok(UserRef {
        id: row.get("id")?,
        tier,
        deploy_counter: UsageCounter {
            count: row.get("deploy_count")?,
            limit: quota::tier_limit(tier, QuotaAction::Deploy),
            reset_at: parse(row.get("deploy_reset_at")?)?,
        },
        function_test_counter: UsageCounter {
            count: row.get("function_test_count")?,
            limit: quota::tier_limit(tier, QuotaAction::FunctionTest),
            reset_at: parse(row.get("function_test_reset_at")?)?,
        },
    })
}

#[derive(Clone)]
pub struct Directory {
    conn: Connection,
}

impl Directory {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Resolve a bearer token to the user it identifies.
    pub async fn resolve_token(&self, token: &str) -> Result<Option<UserRef>, JobError> {
        let token = token.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT * FROM users WHERE api_token = ?1",
                    params![token],
                    row_to_user,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other.into()),
                })
            })
            .await
            .map_err(dir_err)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRef>, JobError> {
        let id = user_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], row_to_user)
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other.into()),
                    })
            })
            .await
            .map_err(dir_err)
    }

    /// Seed or update an account. Used by the daemon at boot and by tests.
    pub async fn upsert_user(
        &self,
        user_id: &str,
        api_token: &str,
        tier: Tier,
    ) -> Result<(), JobError> {
        let id = user_id.to_string();
        let token = api_token.to_string();
        self.conn
            .call(move |conn| {
                let now = Utc::now().to_rfc3339();
                conn.execute(
                    "INSERT INTO users (id, api_token, tier, deploy_reset_at, function_test_reset_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(id) DO UPDATE SET api_token = ?2, tier = ?3",
                    params![id, token, tier_str(tier), now],
                )?;
                Ok(())
            })
            .await
            .map_err(dir_err)
    }

    /// Zero a counter and restart its 30-day window. Called by the quota
    /// gate when it observes an expired period.
    pub async fn reset_counter(&self, user_id: &str, action: QuotaAction) -> Result<(), JobError> {
        let id = user_id.to_string();
        let column = match action {
            QuotaAction::Deploy => ("deploy_count", "deploy_reset_at"),
            QuotaAction::FunctionTest => ("function_test_count", "function_test_reset_at"),
            QuotaAction::Compile => return Ok(()),
        };
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "UPDATE users SET {} = 0, {} = ?2 WHERE id = ?1",
                        column.0, column.1
                    ),
                    params![id, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
            .map_err(dir_err)
    }

    /// Post-success usage increment. Failed attempts never burn quota.
    pub async fn increment_deploy_count(&self, user_id: &str) -> Result<(), JobError> {
        let id = user_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET deploy_count = deploy_count + 1 WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await
            .map_err(dir_err)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<ProjectRef>, JobError> {
        let id = project_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, owner_id, files FROM projects WHERE id = ?1",
                    params![id],
                    |row| {
                        let files: String = row.get("files")?;
                        let files: Vec<SourceFile> =
                            serde_json::from_str(&files).map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(
                                    2,
                                    rusqlite::types::Type::Text,
                                    Box::new(e),
                                )
                            })?;
                        Ok(ProjectRef {
                            id: row.get("id")?,
                            owner_id: row.get("owner_id")?,
                            files,
                        })
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other.into()),
                })
            })
            .await
            .map_err(dir_err)
    }

    pub async fn upsert_project(
        &self,
        project_id: &str,
        owner_id: &str,
        files: &[SourceFile],
    ) -> Result<(), JobError> {
        let id = project_id.to_string();
        let owner = owner_id.to_string();
        let files = serde_json::to_string(files)
            .map_err(|e| JobError::BadInput(format!("project files: {e}")))?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (id, owner_id, files) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET owner_id = ?2, files = ?3",
                    params![id, owner, files],
                )?;
                Ok(())
            })
            .await
            .map_err(dir_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::open_store_in_memory;

    async fn directory() -> Directory {
        Directory::new(open_store_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn token_resolution() {
        let dir = directory().await;
        dir.upsert_user("u1", "tok-1", Tier::Free).await.unwrap();

        let user = dir.resolve_token("tok-1").await.unwrap().unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.tier, Tier::Free);
        assert_eq!(user.deploy_counter.limit, 5);
        assert_eq!(user.function_test_counter.limit, 2);

        assert!(dir.resolve_token("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn limits_follow_tier() {
        let dir = directory().await;
        dir.upsert_user("u2", "tok-2", Tier::TierMid).await.unwrap();
        let user = dir.get_user("u2").await.unwrap().unwrap();
        assert_eq!(user.deploy_counter.limit, -1);
        assert_eq!(user.function_test_counter.limit, 5);
    }

    #[tokio::test]
    async fn increment_and_reset() {
        let dir = directory().await;
        dir.upsert_user("u3", "tok-3", Tier::Free).await.unwrap();

        dir.increment_deploy_count("u3").await.unwrap();
        dir.increment_deploy_count("u3").await.unwrap();
        let user = dir.get_user("u3").await.unwrap().unwrap();
        assert_eq!(user.deploy_counter.count, 2);

        dir.reset_counter("u3", QuotaAction::Deploy).await.unwrap();
        let user = dir.get_user("u3").await.unwrap().unwrap();
        assert_eq!(user.deploy_counter.count, 0);
    }

    #[tokio::test]
    async fn project_round_trip() {
        let dir = directory().await;
        let files = vec![SourceFile {
            name: "Cargo.toml".into(),
            content: "[package]".into(),
        }];
        dir.upsert_project("p1", "u1", &files).await.unwrap();

        let project = dir.get_project("p1").await.unwrap().unwrap();
        assert_eq!(project.owner_id, "u1");
        assert_eq!(project.files, files);
        assert!(dir.get_project("p2").await.unwrap().is_none());
    }
}
