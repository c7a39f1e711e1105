//! Resources and their published content

use anyhow::{Context, Result};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

use super::relationships::{EntityType, RelationshipGraph};
use crate::error::PublishError;

/// One external provider whose harvest is being published
#[derive(Debug, Clone, FromRow)]
pub struct Resource {
    pub id: i64,
    pub name: String,
    /// Short slug the harvester uses in URLs and we use in temp file names.
    pub path: String,
    /// Contributes to the authoritative classification hierarchy.
    pub classification: bool,
}

impl Resource {
    pub async fn find(pool: &PgPool, id: i64) -> Result<Self> {
        sqlx::query_as::<_, Resource>(
            "SELECT id, name, path, classification FROM resources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to load resource")?
        .ok_or_else(|| PublishError::ResourceNotFound(id).into())
    }

    pub async fn create(pool: &PgPool, name: &str, path: &str, classification: bool) -> Result<Self> {
        sqlx::query_as::<_, Resource>(
            r#"
            INSERT INTO resources (name, path, classification)
            VALUES ($1, $2, $3)
            RETURNING id, name, path, classification
            "#,
        )
        .bind(name)
        .bind(path)
        .bind(classification)
        .fetch_one(pool)
        .await
        .context("Failed to create resource")
    }

    pub async fn count_rows(&self, pool: &PgPool, entity: EntityType) -> Result<i64> {
        let sql = format!(
            r#"SELECT COUNT(*) FROM "{}" WHERE resource_id = $1"#,
            entity.table_name()
        );
        sqlx::query_scalar::<_, i64>(sqlx::AssertSqlSafe(sql.as_str()))
            .bind(self.id)
            .fetch_one(pool)
            .await
            .with_context(|| format!("Failed to count {} for resource {}", entity.table_name(), self.id))
    }

    pub async fn has_nodes(&self, pool: &PgPool) -> Result<bool> {
        Ok(self.count_rows(pool, EntityType::Node).await? > 0)
    }

    /// Whether the aggregator has anything to attach to pages.
    pub async fn has_page_content(&self, pool: &PgPool) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM media WHERE resource_id = $1)
                OR EXISTS (SELECT 1 FROM articles WHERE resource_id = $1)
            "#,
        )
        .bind(self.id)
        .fetch_one(pool)
        .await
        .context("Failed to check for media and articles")?;
        Ok(found)
    }

    /// Remove everything a previous publish produced, except traits and the
    /// resource row itself.
    ///
    /// Pages are shared across resources, so they are kept; only their hero
    /// image and native node pointers are detached when they pointed at rows
    /// that are about to go, and the content counters of every page that lost
    /// content are recounted.
    pub async fn remove_non_trait_content(&self, pool: &PgPool, graph: &RelationshipGraph) -> Result<()> {
        info!(resource_id = self.id, "Removing previously published content");

        let mut tx = pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            UPDATE pages SET medium_id = NULL, updated_at = NOW()
            WHERE medium_id IN (SELECT id FROM media WHERE resource_id = $1)
            "#,
        )
        .bind(self.id)
        .execute(&mut *tx)
        .await
        .context("Failed to detach hero images")?;

        sqlx::query(
            r#"
            UPDATE pages SET native_node_id = NULL, updated_at = NOW()
            WHERE native_node_id IN (SELECT id FROM nodes WHERE resource_id = $1)
            "#,
        )
        .bind(self.id)
        .execute(&mut *tx)
        .await
        .context("Failed to detach native nodes")?;

        let mut touched_pages: Vec<i64> =
            sqlx::query_scalar("DELETE FROM page_contents WHERE resource_id = $1 RETURNING page_id")
                .bind(self.id)
                .fetch_all(&mut *tx)
                .await
                .context("Failed to delete page contents")?;
        debug!(removed = touched_pages.len(), "Deleted page contents");
        touched_pages.sort_unstable();
        touched_pages.dedup();

        let entities: Vec<EntityType> = graph.entities().map(|d| d.entity).collect();
        for entity in entities.into_iter().rev() {
            let sql = format!(r#"DELETE FROM "{}" WHERE resource_id = $1"#, entity.table_name());
            let removed = sqlx::query(sqlx::AssertSqlSafe(sql.as_str()))
                .bind(self.id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to delete {}", entity.table_name()))?
                .rows_affected();
            debug!(table = entity.table_name(), removed, "Deleted published rows");
        }

        let recounted = sqlx::query(
            r#"
            UPDATE pages AS p SET
                media_count = (SELECT COUNT(*) FROM page_contents pc
                               WHERE pc.page_id = p.id AND pc.content_type = 'Medium'),
                articles_count = (SELECT COUNT(*) FROM page_contents pc
                                  WHERE pc.page_id = p.id AND pc.content_type = 'Article'),
                updated_at = NOW()
            WHERE p.id = ANY($1)
            "#,
        )
        .bind(&touched_pages)
        .execute(&mut *tx)
        .await
        .context("Failed to recount page contents")?
        .rows_affected();
        debug!(recounted, "Recounted pages");

        tx.commit().await.context("Failed to commit content removal")?;

        Ok(())
    }
}
