//! Derived-state stages
//!
//! Work the publisher delegates once the entity tables are loaded: pages,
//! traits, vernacular preferences and the native-node pointers on pages. The
//! trait keeps the orchestrator testable with stand-ins; [`PgStageHooks`] is
//! the SQL implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::path::Path;
use tracing::info;

use super::import_log::ImportLog;
use super::loader::{BulkLoader, StagedFile};
use super::repo::ResourceRepo;
use super::resource::Resource;

pub const TRAITS_FILE: &str = "traits.tsv";
pub const TRAIT_METADATA_FILE: &str = "metadata.tsv";

/// Where trait exports are fetched to and loaded from
pub struct TraitSource<'a> {
    pub repo: &'a dyn ResourceRepo,
    pub loader: &'a BulkLoader,
    pub tmp_dir: &'a Path,
}

#[async_trait]
pub trait StageHooks: Send + Sync {
    /// Re-apply curated preferred common names to freshly loaded vernaculars.
    async fn restore_vernacular_preferences(&self, resource: &Resource, log: &ImportLog) -> Result<()>;

    /// Make sure every page the resource's nodes name exists.
    async fn create_pages(&self, resource: &Resource, log: &ImportLog) -> Result<()>;

    /// Replace the resource's traits. Returns the files it staged.
    async fn publish_traits(
        &self,
        resource: &Resource,
        log: &ImportLog,
        source: TraitSource<'_>,
    ) -> Result<Vec<StagedFile>>;

    /// Repoint pages whose native node disappeared.
    async fn fix_native_nodes(&self, resource: &Resource, log: &ImportLog) -> Result<()>;

    /// Make the resource's nodes the native nodes of their pages.
    async fn update_classification(&self, resource: &Resource, log: &ImportLog) -> Result<()>;
}

/// First node per page for a resource.
const RESOURCE_PAGE_NODES: &str = r#"
    SELECT DISTINCT ON (page_id) page_id, id
    FROM nodes
    WHERE resource_id = $1 AND page_id IS NOT NULL
    ORDER BY page_id, id
"#;

#[derive(Debug, Clone)]
pub struct PgStageHooks {
    pool: PgPool,
}

impl PgStageHooks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageHooks for PgStageHooks {
    async fn restore_vernacular_preferences(&self, resource: &Resource, log: &ImportLog) -> Result<()> {
        log.start("Restoring vernacular preferences").await?;

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let restored = sqlx::query(
            r#"
            UPDATE vernaculars AS v SET is_preferred = (v.string = vp.string)
            FROM vernacular_preferences AS vp
            WHERE vp.resource_id = $1 AND v.resource_id = $1
              AND v.page_id = vp.page_id AND v.language_code = vp.language_code
            "#,
        )
        .bind(resource.id)
        .execute(&mut *tx)
        .await
        .context("Failed to restore preferred vernaculars")?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE vernacular_preferences AS vp SET vernacular_id = v.id
            FROM vernaculars AS v
            WHERE vp.resource_id = $1 AND v.resource_id = $1
              AND v.page_id = vp.page_id AND v.language_code = vp.language_code
              AND v.string = vp.string
            "#,
        )
        .bind(resource.id)
        .execute(&mut *tx)
        .await
        .context("Failed to relink vernacular preferences")?;

        tx.commit().await.context("Failed to commit vernacular preferences")?;

        log.info(&format!("{} vernaculars updated from preferences", restored))
            .await
    }

    async fn create_pages(&self, resource: &Resource, log: &ImportLog) -> Result<()> {
        log.start("Creating pages").await?;

        let created = sqlx::query(sqlx::AssertSqlSafe(format!(
            r#"
            INSERT INTO pages (id, native_node_id)
            SELECT page_id, id FROM ({}) AS n
            ON CONFLICT (id) DO NOTHING
            "#,
            RESOURCE_PAGE_NODES
        )))
        .bind(resource.id)
        .execute(&self.pool)
        .await
        .context("Failed to create pages")?
        .rows_affected();

        let adopted = sqlx::query(sqlx::AssertSqlSafe(format!(
            r#"
            UPDATE pages AS p SET native_node_id = n.id, updated_at = NOW()
            FROM ({}) AS n
            WHERE p.id = n.page_id AND p.native_node_id IS NULL
            "#,
            RESOURCE_PAGE_NODES
        )))
        .bind(resource.id)
        .execute(&self.pool)
        .await
        .context("Failed to set native nodes")?
        .rows_affected();

        info!(resource_id = resource.id, created, adopted, "Pages created");
        log.info(&format!("{} pages created, {} existing pages adopted", created, adopted))
            .await
    }

    async fn publish_traits(
        &self,
        resource: &Resource,
        log: &ImportLog,
        source: TraitSource<'_>,
    ) -> Result<Vec<StagedFile>> {
        log.start("Publishing traits").await?;

        let mut staged = Vec::new();
        let Some(traits) = StagedFile::fetch(source.repo, resource, TRAITS_FILE, source.tmp_dir).await? else {
            log.info(&format!("No {}; skipping traits", source.repo.describe(TRAITS_FILE)))
                .await?;
            return Ok(staged);
        };
        staged.push(traits.clone());

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for table in ["trait_metadata", "traits"] {
            sqlx::query(sqlx::AssertSqlSafe(format!("DELETE FROM {} WHERE resource_id = $1", table)))
                .bind(resource.id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to delete previous {}", table))?;
        }
        tx.commit().await.context("Failed to commit trait removal")?;

        source.loader.load(resource.id, "traits", &traits).await?;

        if let Some(metadata) =
            StagedFile::fetch(source.repo, resource, TRAIT_METADATA_FILE, source.tmp_dir).await?
        {
            staged.push(metadata.clone());
            source.loader.load(resource.id, "trait_metadata", &metadata).await?;
        }

        Ok(staged)
    }

    async fn fix_native_nodes(&self, resource: &Resource, log: &ImportLog) -> Result<()> {
        log.start("Fixing native nodes").await?;

        let fixed = sqlx::query(sqlx::AssertSqlSafe(format!(
            r#"
            UPDATE pages AS p SET native_node_id = n.id, updated_at = NOW()
            FROM ({}) AS n
            WHERE p.id = n.page_id
              AND (p.native_node_id IS NULL
                   OR NOT EXISTS (SELECT 1 FROM nodes x WHERE x.id = p.native_node_id))
            "#,
            RESOURCE_PAGE_NODES
        )))
        .bind(resource.id)
        .execute(&self.pool)
        .await
        .context("Failed to fix native nodes")?
        .rows_affected();

        log.info(&format!("{} pages repointed to this resource's nodes", fixed))
            .await
    }

    async fn update_classification(&self, resource: &Resource, log: &ImportLog) -> Result<()> {
        log.start("Updating classification").await?;

        let updated = sqlx::query(sqlx::AssertSqlSafe(format!(
            r#"
            UPDATE pages AS p SET native_node_id = n.id, updated_at = NOW()
            FROM ({}) AS n
            WHERE p.id = n.page_id AND p.native_node_id IS DISTINCT FROM n.id
            "#,
            RESOURCE_PAGE_NODES
        )))
        .bind(resource.id)
        .execute(&self.pool)
        .await
        .context("Failed to update classification")?
        .rows_affected();

        log.info(&format!("{} pages now use this resource's classification", updated))
            .await
    }
}
