//! Content aggregator
//!
//! Attaches a resource's media and articles to pages: each item goes on its
//! own page and, for media, on every ancestor page too. Positions continue
//! after whatever a page already shows, and pages without a hero image pick
//! up the first image attached to them.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::import_log::ImportLog;
use crate::error::PublishError;

/// Media subclass stored for still images.
pub const IMAGE_SUBCLASS: i16 = 0;

/// Rows per `INSERT` into page_contents (6 binds each).
const INSERT_CHUNK_ROWS: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContentKind {
    Medium,
    Article,
}

impl ContentKind {
    pub fn table_name(self) -> &'static str {
        match self {
            ContentKind::Medium => "media",
            ContentKind::Article => "articles",
        }
    }

    /// Value of `page_contents.content_type`.
    pub fn class_name(self) -> &'static str {
        match self {
            ContentKind::Medium => "Medium",
            ContentKind::Article => "Article",
        }
    }

    fn batch_sql(self) -> &'static str {
        match self {
            ContentKind::Medium => {
                r#"
                SELECT id, page_id, subclass FROM media
                WHERE resource_id = $1 AND page_id IS NOT NULL AND id > $2
                ORDER BY id LIMIT $3
                "#
            },
            ContentKind::Article => {
                r#"
                SELECT id, page_id, NULL::SMALLINT AS subclass FROM articles
                WHERE resource_id = $1 AND page_id IS NOT NULL AND id > $2
                ORDER BY id LIMIT $3
                "#
            },
        }
    }
}

/// One medium or article waiting to be attached
#[derive(Debug, Clone, Copy, FromRow, PartialEq, Eq)]
pub struct ContentRow {
    pub id: i64,
    pub page_id: i64,
    pub subclass: Option<i16>,
}

impl ContentRow {
    pub fn is_image(&self) -> bool {
        self.subclass == Some(IMAGE_SUBCLASS)
    }
}

/// Next free position per page, carried from batch to batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionAccumulator {
    next: HashMap<i64, i32>,
}

impl PositionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self, page_id: i64) -> bool {
        self.next.contains_key(&page_id)
    }

    /// First sight of a page. A page that already shows content keeps its
    /// position 0 (the current hero), so new content starts at 1.
    pub fn seed(&mut self, page_id: i64, existing: i64) {
        self.next
            .entry(page_id)
            .or_insert(if existing == 0 { 0 } else { 1 });
    }

    /// Claim the next position on `page_id`.
    pub fn claim(&mut self, page_id: i64) -> i32 {
        let slot = self.next.entry(page_id).or_insert(0);
        let position = *slot;
        *slot += 1;
        position
    }

    pub fn pages(&self) -> usize {
        self.next.len()
    }
}

/// Row for page_contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContentRow {
    pub page_id: i64,
    pub source_page_id: i64,
    pub content_id: i64,
    pub position: i32,
}

/// What one batch writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub contents: Vec<PageContentRow>,
    /// `(page_id, medium_id)` for pages that get a hero image.
    pub heroes: Vec<(i64, i64)>,
}

/// Lay out one batch. Every page in `rows` and `ancestry` must already be
/// seeded in `positions`.
pub fn plan_batch(
    kind: ContentKind,
    rows: &[ContentRow],
    ancestry: &HashMap<i64, Vec<i64>>,
    naked_pages: &HashSet<i64>,
    mut positions: PositionAccumulator,
) -> (BatchPlan, PositionAccumulator) {
    let mut plan = BatchPlan::default();
    let mut heroes: HashMap<i64, i64> = HashMap::new();

    for row in rows {
        plan.contents.push(PageContentRow {
            page_id: row.page_id,
            source_page_id: row.page_id,
            content_id: row.id,
            position: positions.claim(row.page_id),
        });

        if kind == ContentKind::Medium && row.is_image() && naked_pages.contains(&row.page_id) {
            heroes.entry(row.page_id).or_insert(row.id);
        }

        if kind == ContentKind::Medium {
            for &ancestor in ancestry.get(&row.page_id).into_iter().flatten() {
                if ancestor == row.page_id {
                    continue;
                }
                plan.contents.push(PageContentRow {
                    page_id: ancestor,
                    source_page_id: row.page_id,
                    content_id: row.id,
                    position: positions.claim(ancestor),
                });
            }
        }
    }

    let mut heroes: Vec<(i64, i64)> = heroes.into_iter().collect();
    heroes.sort_unstable();
    plan.heroes = heroes;

    (plan, positions)
}

/// Totals for one content kind
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AggregateReport {
    pub items: u64,
    pub batches: u64,
    pub associations: u64,
    pub heroes: u64,
}

#[derive(Debug, Clone)]
pub struct ContentAggregator {
    pool: PgPool,
    log: ImportLog,
    batch_size: i64,
    cancel: CancellationToken,
}

impl ContentAggregator {
    pub fn new(pool: PgPool, log: ImportLog, batch_size: i64, cancel: CancellationToken) -> Self {
        Self {
            pool,
            log,
            batch_size,
            cancel,
        }
    }

    /// Attach media, then articles, then recount the pages touched.
    pub async fn aggregate_resource(&self, resource_id: i64) -> Result<()> {
        self.log.start("Aggregating page content").await?;
        for kind in [ContentKind::Medium, ContentKind::Article] {
            self.aggregate(resource_id, kind).await?;
        }
        self.reconcile_counts(resource_id).await?;
        Ok(())
    }

    pub async fn aggregate(&self, resource_id: i64, kind: ContentKind) -> Result<AggregateReport> {
        let total: i64 = sqlx::query_scalar(sqlx::AssertSqlSafe(format!(
            "SELECT COUNT(*) FROM {} WHERE resource_id = $1 AND page_id IS NOT NULL",
            kind.table_name()
        )))
        .bind(resource_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to count {}", kind.table_name()))?;

        let batches = (total + self.batch_size - 1) / self.batch_size;
        self.log
            .info(&format!(
                "{} {} to process (in {} batches)",
                total,
                kind.table_name(),
                batches
            ))
            .await?;

        let mut report = AggregateReport {
            items: total as u64,
            ..AggregateReport::default()
        };
        let mut positions = PositionAccumulator::new();
        let mut last_id = 0i64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PublishError::Cancelled(format!("aggregation of {}", kind.table_name())).into());
            }

            let rows: Vec<ContentRow> = sqlx::query_as(kind.batch_sql())
                .bind(resource_id)
                .bind(last_id)
                .bind(self.batch_size)
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("Failed to read {} batch", kind.table_name()))?;

            let Some(last) = rows.last() else {
                break;
            };
            last_id = last.id;
            report.batches += 1;

            self.log
                .append_or_merge_update(&format!("Batch {}/{}...", report.batches, batches))
                .await?;

            let (associations, heroes, carried) = self.process_batch(resource_id, kind, &rows, positions).await?;
            positions = carried;
            report.associations += associations;
            report.heroes += heroes;
        }

        info!(
            resource_id,
            kind = kind.class_name(),
            items = report.items,
            associations = report.associations,
            heroes = report.heroes,
            "Content aggregated"
        );

        Ok(report)
    }

    /// Attach one batch, returning rows inserted, heroes set and the
    /// accumulator for the next batch.
    pub async fn process_batch(
        &self,
        resource_id: i64,
        kind: ContentKind,
        rows: &[ContentRow],
        mut positions: PositionAccumulator,
    ) -> Result<(u64, u64, PositionAccumulator)> {
        let own_pages: Vec<i64> = unique(rows.iter().map(|r| r.page_id));

        let ancestry = match kind {
            ContentKind::Medium => self.ancestry(&own_pages).await?,
            ContentKind::Article => HashMap::new(),
        };
        let naked_pages = match kind {
            ContentKind::Medium => self.naked_pages(&own_pages).await?,
            ContentKind::Article => HashSet::new(),
        };

        let unseeded: Vec<i64> = unique(
            own_pages
                .iter()
                .copied()
                .chain(ancestry.values().flatten().copied())
                .filter(|page| !positions.is_seeded(*page)),
        );
        if !unseeded.is_empty() {
            let counts = self.existing_counts(kind, &unseeded).await?;
            for page in unseeded {
                positions.seed(page, counts.get(&page).copied().unwrap_or(0));
            }
        }

        let (plan, positions) = plan_batch(kind, rows, &ancestry, &naked_pages, positions);

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let mut inserted = 0;
        for chunk in plan.contents.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO page_contents (page_id, source_page_id, resource_id, content_type, content_id, position) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.page_id)
                    .push_bind(row.source_page_id)
                    .push_bind(resource_id)
                    .push_bind(kind.class_name())
                    .push_bind(row.content_id)
                    .push_bind(row.position);
            });
            builder.push(" ON CONFLICT (page_id, content_type, content_id) DO NOTHING");

            inserted += builder
                .build()
                .execute(&mut *tx)
                .await
                .context("Failed to insert page contents")?
                .rows_affected();
        }

        let mut heroes = 0;
        if !plan.heroes.is_empty() {
            let (pages, media): (Vec<i64>, Vec<i64>) = plan.heroes.iter().copied().unzip();
            heroes = sqlx::query(
                r#"
                UPDATE pages AS p SET medium_id = h.medium_id, updated_at = NOW()
                FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS h(page_id, medium_id)
                WHERE p.id = h.page_id AND p.medium_id IS NULL
                "#,
            )
            .bind(&pages)
            .bind(&media)
            .execute(&mut *tx)
            .await
            .context("Failed to set hero images")?
            .rows_affected();
        }

        tx.commit().await.context("Failed to commit page contents")?;

        debug!(resource_id, inserted, heroes, pages = positions.pages(), "Batch attached");

        Ok((inserted, heroes, positions))
    }

    /// Recount media and articles on every page this resource contributed to.
    pub async fn reconcile_counts(&self, resource_id: i64) -> Result<u64> {
        self.log.start("Fixing page content counts").await?;
        let updated = sqlx::query(
            r#"
            UPDATE pages AS p SET
                media_count = (SELECT COUNT(*) FROM page_contents pc
                               WHERE pc.page_id = p.id AND pc.content_type = 'Medium'),
                articles_count = (SELECT COUNT(*) FROM page_contents pc
                                  WHERE pc.page_id = p.id AND pc.content_type = 'Article'),
                updated_at = NOW()
            WHERE p.id IN (SELECT DISTINCT page_id FROM page_contents WHERE resource_id = $1)
            "#,
        )
        .bind(resource_id)
        .execute(&self.pool)
        .await
        .context("Failed to recount page contents")?
        .rows_affected();
        Ok(updated)
    }

    /// Give every page without a hero image its lowest-positioned image.
    pub async fn fix_missing_icons(&self) -> Result<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE pages AS p SET medium_id = first.content_id, updated_at = NOW()
            FROM (
                SELECT DISTINCT ON (pc.page_id) pc.page_id, pc.content_id
                FROM page_contents pc
                JOIN media m ON m.id = pc.content_id
                WHERE pc.content_type = 'Medium' AND m.subclass = $1
                ORDER BY pc.page_id, pc.position, pc.id
            ) AS first
            WHERE p.id = first.page_id AND p.medium_id IS NULL
            "#,
        )
        .bind(IMAGE_SUBCLASS)
        .execute(&self.pool)
        .await
        .context("Failed to fix missing icons")?
        .rows_affected();
        Ok(updated)
    }

    /// Ancestor page ids for each page, in depth order, via the page's
    /// native node.
    async fn ancestry(&self, pages: &[i64]) -> Result<HashMap<i64, Vec<i64>>> {
        let pairs: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT p.id, a.page_id
            FROM pages p
            JOIN node_ancestors na ON na.node_id = p.native_node_id
            JOIN nodes a ON a.id = na.ancestor_id
            WHERE p.id = ANY($1) AND a.page_id IS NOT NULL AND a.page_id <> p.id
            ORDER BY p.id, na.depth, na.id
            "#,
        )
        .bind(pages)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load page ancestry")?;

        let mut ancestry: HashMap<i64, Vec<i64>> = HashMap::new();
        for (page, ancestor) in pairs {
            let ancestors = ancestry.entry(page).or_default();
            if !ancestors.contains(&ancestor) {
                ancestors.push(ancestor);
            }
        }
        Ok(ancestry)
    }

    async fn naked_pages(&self, pages: &[i64]) -> Result<HashSet<i64>> {
        let naked: Vec<i64> = sqlx::query_scalar("SELECT id FROM pages WHERE id = ANY($1) AND medium_id IS NULL")
            .bind(pages)
            .fetch_all(&self.pool)
            .await
            .context("Failed to find pages without a hero image")?;
        Ok(naked.into_iter().collect())
    }

    async fn existing_counts(&self, kind: ContentKind, pages: &[i64]) -> Result<HashMap<i64, i64>> {
        let counts: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT page_id, COUNT(*) FROM page_contents
            WHERE page_id = ANY($1) AND content_type = $2
            GROUP BY page_id
            "#,
        )
        .bind(pages)
        .bind(kind.class_name())
        .fetch_all(&self.pool)
        .await
        .context("Failed to count existing page contents")?;
        Ok(counts.into_iter().collect())
    }
}

fn unique(ids: impl Iterator<Item = i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}
