//! Registry bookkeeping for installed skills (built-in and user-installed).

use super::Db;
use crate::db::models::SkillRegistryRow;
use crate::error::Result;
use anyhow::Context as _;
use sqlx::Row as _;

pub struct SkillRegistryStore<'a> {
    db: &'a Db,
}

impl<'a> SkillRegistryStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub async fn upsert(
        &self,
        name: &str,
        origin: &str,
        directory: Option<&str>,
        manifest_version: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO skills_registry (name, enabled, origin, directory, manifest_version) \
             VALUES (?, 1, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
                origin = excluded.origin, directory = excluded.directory, \
                manifest_version = excluded.manifest_version",
        )
        .bind(name)
        .bind(origin)
        .bind(directory)
        .bind(manifest_version)
        .execute(&self.db.pool)
        .await
        .context("failed to upsert skill registry row")?;
        Ok(())
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE skills_registry SET enabled = ? WHERE name = ?")
            .bind(enabled)
            .bind(name)
            .execute(&self.db.pool)
            .await
            .context("failed to set skill enabled flag")?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<SkillRegistryRow>> {
        let rows = sqlx::query("SELECT name, enabled, origin, directory, manifest_version FROM skills_registry")
            .fetch_all(&self.db.pool)
            .await
            .context("failed to list skills")?;

        rows.into_iter()
            .map(|row| {
                Ok(SkillRegistryRow {
                    name: row.try_get("name")?,
                    enabled: row.try_get::<i64, _>("enabled")? != 0,
                    origin: row.try_get("origin")?,
                    directory: row.try_get("directory")?,
                    manifest_version: row.try_get("manifest_version")?,
                })
            })
            .collect()
    }
}
