//! End-to-end publishing tests
//!
//! Each test publishes from a temp export directory into a fresh database
//! and checks the rows, the import log and the run bookkeeping left behind.

use publish_server::error::find_publish_error;
use publish_server::publishing::{EntityType, EventCategory, ImportLog, RunGuard};
use publish_server::PublishError;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

mod common;
use common::*;

async fn latest_log(pool: &PgPool, resource_id: i64) -> ImportLog {
    ImportLog::latest(pool, resource_id)
        .await
        .unwrap()
        .expect("No import log")
}

async fn nothing_running(pool: &PgPool) -> bool {
    RunGuard::new(pool.clone())
        .running_detail()
        .await
        .unwrap()
        .is_none()
}

// ============================================================================
// Loading and propagation
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_parent_ids_are_propagated(pool: PgPool) -> anyhow::Result<()> {
    // Another resource's node takes production id 1 so ids cannot line up by accident.
    let other = resource(&pool, "Other", "other").await;
    sqlx::query("INSERT INTO nodes (resource_id, harv_db_id, page_id) VALUES ($1, 1, 999)")
        .bind(other.id)
        .execute(&pool)
        .await?;

    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write(
        "nodes.tsv",
        &[
            node_row(fish.id, 1, 100, None, "Gadiformes"),
            node_row(fish.id, 2, 101, Some(1), "Gadidae"),
            node_row(fish.id, 3, 102, Some(2), "Gadus"),
        ],
    );

    exports.publisher(&pool).publish(&fish, &exports.repo()).await?;

    let first = node_id(&pool, fish.id, 1).await;
    let second = node_id(&pool, fish.id, 2).await;
    let third = node_id(&pool, fish.id, 3).await;

    let parent_of = |id: i64| {
        let pool = pool.clone();
        async move {
            sqlx::query_scalar::<_, Option<i64>>("SELECT parent_id FROM nodes WHERE id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await
                .unwrap()
        }
    };
    assert_ne!(first, 1);
    assert_eq!(parent_of(second).await, Some(first));
    assert_eq!(parent_of(third).await, Some(second));
    assert_eq!(parent_of(first).await, None);

    // The other resource's row is untouched.
    let other_node: Option<i64> = sqlx::query_scalar("SELECT parent_id FROM nodes WHERE resource_id = $1")
        .bind(other.id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(other_node, None);

    let native: Option<i64> = sqlx::query_scalar("SELECT native_node_id FROM pages WHERE id = 102")
        .fetch_one(&pool)
        .await?;
    assert_eq!(native, Some(third));

    let log = latest_log(&pool, fish.id).await;
    let status = log.status().await?;
    assert_eq!(status.status, "completed");
    assert!(status.completed_at.is_some());
    assert!(status.failed_at.is_none());

    let events = log.events().await?;
    let last = events.last().expect("No events");
    assert_eq!(last.category(), Some(EventCategory::Infos));
    assert!(last.body.starts_with("TOTAL TIME: 0:00:"));

    // Staged copies are removed after a clean run.
    assert_eq!(std::fs::read_dir(exports.staging())?.count(), 0);
    assert!(nothing_running(&pool).await);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_republish_is_idempotent(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write(
        "nodes.tsv",
        &[
            node_row(fish.id, 1, 100, None, "Gadiformes"),
            node_row(fish.id, 2, 101, Some(1), "Gadidae"),
            node_row(fish.id, 3, 102, Some(2), "Gadus"),
        ],
    );
    exports.write(
        "vernaculars.tsv",
        &[
            vernacular_row(fish.id, 1, 3, 102, "cod"),
            vernacular_row(fish.id, 2, 2, 101, "cod family"),
        ],
    );
    exports.write(
        "media.tsv",
        &[medium_row(fish.id, 1, 102, 0), medium_row(fish.id, 2, 102, 1)],
    );

    // (node harvest id, parent harvest id) and (vernacular, node harvest id)
    let snapshot = || {
        let pool = pool.clone();
        async move {
            let nodes: Vec<(i64, Option<i64>)> = sqlx::query_as(
                r#"
                SELECT n.harv_db_id, p.harv_db_id FROM nodes n
                LEFT JOIN nodes p ON p.id = n.parent_id
                ORDER BY n.harv_db_id
                "#,
            )
            .fetch_all(&pool)
            .await
            .unwrap();
            let vernaculars: Vec<(String, Option<i64>)> = sqlx::query_as(
                r#"
                SELECT v.string, n.harv_db_id FROM vernaculars v
                LEFT JOIN nodes n ON n.id = v.node_id
                ORDER BY v.string
                "#,
            )
            .fetch_all(&pool)
            .await
            .unwrap();
            let contents: Vec<(i64, i32)> =
                sqlx::query_as("SELECT page_id, position FROM page_contents ORDER BY page_id, position")
                    .fetch_all(&pool)
                    .await
                    .unwrap();
            (nodes, vernaculars, contents)
        }
    };

    let publisher = exports.publisher(&pool);
    publisher.publish(&fish, &exports.repo()).await?;
    let first = snapshot().await;

    publisher.publish(&fish, &exports.repo()).await?;
    let second = snapshot().await;

    assert_eq!(first, second);
    assert_eq!(first.0, vec![(1, None), (2, Some(1)), (3, Some(2))]);
    assert_eq!(count(&pool, "media").await, 2);
    assert_eq!(count(&pool, "nodes").await, 3);

    let events = latest_log(&pool, fish.id).await.events().await?;
    assert!(events
        .iter()
        .any(|e| e.body == "All existing content has been destroyed for the resource."));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_trailing_blank_line_is_tolerated(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    let rows = [
        node_row(fish.id, 1, 100, None, "Gadiformes"),
        node_row(fish.id, 2, 101, Some(1), "Gadidae"),
        node_row(fish.id, 3, 102, Some(2), "Gadus"),
    ];
    exports.write_raw("nodes.tsv", &format!("{}\n\n", rows.join("\n")));

    exports.publisher(&pool).publish(&fish, &exports.repo()).await?;

    assert_eq!(count(&pool, "nodes").await, 3);
    let log = latest_log(&pool, fish.id).await;
    assert_eq!(log.status().await?.status, "completed");
    assert!(!log
        .events()
        .await?
        .iter()
        .any(|e| e.category() == Some(EventCategory::Errors)));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_load_local_file_keeps_the_file(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write(
        "nodes.tsv",
        &[
            node_row(fish.id, 1, 100, None, "Gadiformes"),
            node_row(fish.id, 2, 101, Some(1), "Gadidae"),
        ],
    );
    let publisher = exports.publisher(&pool);
    publisher.publish(&fish, &exports.repo()).await?;

    let path = exports.write("patched_vernaculars.tsv", &[vernacular_row(fish.id, 9, 2, 101, "cods")]);
    let report = publisher
        .load_local_file(&fish, EntityType::Vernacular, &path)
        .await?;

    assert_eq!(report.rows_loaded, 1);
    assert!(path.exists());

    let node: Option<i64> = sqlx::query_scalar("SELECT node_id FROM vernaculars WHERE harv_db_id = 9")
        .fetch_one(&pool)
        .await?;
    assert_eq!(node, Some(node_id(&pool, fish.id, 2).await));
    // Nothing was purged.
    assert_eq!(count(&pool, "nodes").await, 2);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_load_local_file_leaves_earlier_rows_alone(pool: PgPool) -> anyhow::Result<()> {
    // Offset production ids by one so an already-propagated node id is also
    // some other node's harvest id.
    let other = resource(&pool, "Other", "other").await;
    sqlx::query("INSERT INTO nodes (resource_id, harv_db_id, page_id) VALUES ($1, 1, 999)")
        .bind(other.id)
        .execute(&pool)
        .await?;

    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write(
        "nodes.tsv",
        &[
            node_row(fish.id, 1, 100, None, "Gadiformes"),
            node_row(fish.id, 2, 101, Some(1), "Gadidae"),
            node_row(fish.id, 3, 102, Some(2), "Gadus"),
        ],
    );
    exports.write("vernaculars.tsv", &[vernacular_row(fish.id, 1, 2, 101, "cod family")]);

    let publisher = exports.publisher(&pool);
    publisher.publish(&fish, &exports.repo()).await?;

    let family = node_id(&pool, fish.id, 2).await;
    let genus = node_id(&pool, fish.id, 3).await;
    assert_eq!(family, 3);

    let path = exports.write("extra_vernaculars.tsv", &[vernacular_row(fish.id, 2, 3, 102, "cod")]);
    publisher
        .load_local_file(&fish, EntityType::Vernacular, &path)
        .await?;

    let nodes: Vec<(i64, Option<i64>)> =
        sqlx::query_as("SELECT harv_db_id, node_id FROM vernaculars WHERE resource_id = $1 ORDER BY harv_db_id")
            .bind(fish.id)
            .fetch_all(&pool)
            .await?;
    assert_eq!(nodes, vec![(1, Some(family)), (2, Some(genus))]);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_quotes_tabs_and_escapes_survive_loading(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write("nodes.tsv", &[node_row(fish.id, 1, 100, None, "Gadus")]);
    exports.write(
        "vernaculars.tsv",
        &[
            vernacular_row(fish.id, 1, 1, 100, "the \"true\" cod"),
            vernacular_row(fish.id, 2, 1, 100, "\"cod\tfish\""),
            vernacular_row(fish.id, 3, 1, 100, "back\\\\slash"),
            vernacular_row(fish.id, 4, 1, 100, "two\\nlines"),
        ],
    );

    exports.publisher(&pool).publish(&fish, &exports.repo()).await?;

    let strings: Vec<String> =
        sqlx::query_scalar("SELECT string FROM vernaculars WHERE resource_id = $1 ORDER BY harv_db_id")
            .bind(fish.id)
            .fetch_all(&pool)
            .await?;
    assert_eq!(
        strings,
        vec![
            "the \"true\" cod".to_string(),
            "cod\tfish".to_string(),
            "back\\slash".to_string(),
            "two\nlines".to_string(),
        ]
    );

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_row_count_mismatch_warns_and_continues(pool: PgPool) -> anyhow::Result<()> {
    let other = resource(&pool, "Other", "other").await;
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write(
        "nodes.tsv",
        &[
            node_row(fish.id, 1, 100, None, "Gadiformes"),
            node_row(fish.id, 2, 101, Some(1), "Gadidae"),
        ],
    );
    // Every row names the wrong resource, so none count as loaded for fish.
    exports.write(
        "vernaculars.tsv",
        &[
            vernacular_row(other.id, 1, 1, 100, "cod"),
            vernacular_row(other.id, 2, 2, 101, "cod family"),
            vernacular_row(other.id, 3, 2, 101, "true cods"),
        ],
    );

    exports.publisher(&pool).publish(&fish, &exports.repo()).await?;

    let log = latest_log(&pool, fish.id).await;
    let warns: Vec<String> = log
        .events()
        .await?
        .into_iter()
        .filter(|e| e.category() == Some(EventCategory::Warns))
        .map(|e| e.body)
        .collect();
    assert!(warns
        .iter()
        .any(|w| w.starts_with("INCORRECT NUMBER OF ROWS for vernaculars")));

    // Later stages still ran and the run completed.
    let parent: Option<i64> = sqlx::query_scalar("SELECT parent_id FROM nodes WHERE id = $1")
        .bind(node_id(&pool, fish.id, 2).await)
        .fetch_one(&pool)
        .await?;
    assert_eq!(parent, Some(node_id(&pool, fish.id, 1).await));
    assert_eq!(log.status().await?.status, "completed");
    assert!(nothing_running(&pool).await);

    Ok(())
}

// ============================================================================
// Run guard and failures
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_open_log_refuses_publish_without_writing(pool: PgPool) -> anyhow::Result<()> {
    let busy = resource(&pool, "Busy", "busy").await;
    ImportLog::create(&pool, busy.id).await?.begin().await?;

    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write("nodes.tsv", &[node_row(fish.id, 1, 100, None, "Gadus")]);

    let logs = count(&pool, "import_logs").await;
    let events = count(&pool, "import_events").await;
    let runs = count(&pool, "import_runs").await;

    let err = exports
        .publisher(&pool)
        .publish(&fish, &exports.repo())
        .await
        .unwrap_err();

    match find_publish_error(&err) {
        Some(PublishError::AlreadyRunning(detail)) => assert!(detail.contains("Busy")),
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }
    assert_eq!(count(&pool, "import_logs").await, logs);
    assert_eq!(count(&pool, "import_events").await, events);
    assert_eq!(count(&pool, "import_runs").await, runs);
    assert_eq!(count(&pool, "nodes").await, 0);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_missing_nodes_file_fails_the_log(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write("vernaculars.tsv", &[vernacular_row(fish.id, 1, 1, 100, "cod")]);

    let err = exports
        .publisher(&pool)
        .publish(&fish, &exports.repo())
        .await
        .unwrap_err();
    assert!(matches!(
        find_publish_error(&err),
        Some(PublishError::MissingSourceFile { file, .. }) if file == "nodes.tsv"
    ));

    let status = latest_log(&pool, fish.id).await.status().await?;
    assert!(status.failed_at.is_some());
    assert!(status.status.contains("nodes.tsv does not exist!"));
    assert!(status.status.chars().count() <= 250);

    // The lease was given back, so the next run may start.
    assert!(nothing_running(&pool).await);
    let lease = RunGuard::new(pool.clone()).acquire(fish.id).await?;
    lease.release().await?;

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_cancelled_publish_finalizes_and_releases(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write("nodes.tsv", &[node_row(fish.id, 1, 100, None, "Gadus")]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = exports
        .publisher(&pool)
        .with_cancellation(cancel)
        .publish(&fish, &exports.repo())
        .await
        .unwrap_err();

    assert!(matches!(find_publish_error(&err), Some(PublishError::Cancelled(_))));
    assert!(latest_log(&pool, fish.id).await.status().await?.failed_at.is_some());
    assert!(nothing_running(&pool).await);

    Ok(())
}

// ============================================================================
// Traits
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_trait_failure_finalizes_as_failed(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write(
        "nodes.tsv",
        &[
            node_row(fish.id, 1, 100, None, "Gadiformes"),
            node_row(fish.id, 2, 101, Some(1), "Gadidae"),
        ],
    );
    // Too many columns for the traits table.
    exports.write_raw("traits.tsv", &format!("{}\t{}\n", trait_row(fish.id, "R1", 100), "extra\tcolumns"));

    let err = exports
        .publisher(&pool)
        .publish(&fish, &exports.repo())
        .await
        .unwrap_err();
    assert!(matches!(find_publish_error(&err), Some(PublishError::TraitLoadFailure(_))));

    // Later stages still ran.
    let second = node_id(&pool, fish.id, 2).await;
    let parent: Option<i64> = sqlx::query_scalar("SELECT parent_id FROM nodes WHERE id = $1")
        .bind(second)
        .fetch_one(&pool)
        .await?;
    assert_eq!(parent, Some(node_id(&pool, fish.id, 1).await));

    let log = latest_log(&pool, fish.id).await;
    let status = log.status().await?;
    assert!(status.failed_at.is_some());
    assert!(status.completed_at.is_none());
    assert!(status.status.starts_with("Trait publishing failed"));
    assert!(log
        .events()
        .await?
        .iter()
        .any(|e| e.category() == Some(EventCategory::Warns) && e.body.starts_with("Trait publishing failed")));

    // Staged files are kept for inspection.
    assert!(exports.staging().join("fish_nodes.tsv").exists());
    assert!(exports.staging().join("fish_traits.tsv").exists());
    assert!(nothing_running(&pool).await);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_traits_by_resource_replaces_traits(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    sqlx::query("INSERT INTO traits (resource_id, eol_pk, page_id) VALUES ($1, 'OLD', 100)")
        .bind(fish.id)
        .execute(&pool)
        .await?;

    let exports = Exports::new();
    exports.write(
        "traits.tsv",
        &[trait_row(fish.id, "R1", 100), trait_row(fish.id, "R2", 101)],
    );

    exports
        .publisher(&pool)
        .traits_by_resource(&fish, &exports.repo())
        .await?;

    let pks: Vec<String> = sqlx::query_scalar("SELECT eol_pk FROM traits ORDER BY eol_pk")
        .fetch_all(&pool)
        .await?;
    assert_eq!(pks, vec!["R1", "R2"]);
    assert_eq!(latest_log(&pool, fish.id).await.status().await?.status, "completed");

    Ok(())
}

// ============================================================================
// Content aggregation
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_media_heroes_and_ancestor_positions(pool: PgPool) -> anyhow::Result<()> {
    // Page 100 already shows another resource's image as its hero.
    let other = resource(&pool, "Other", "other").await;
    let existing: i64 = sqlx::query_scalar(
        "INSERT INTO media (resource_id, harv_db_id, page_id, subclass) VALUES ($1, 1, 100, 0) RETURNING id",
    )
    .bind(other.id)
    .fetch_one(&pool)
    .await?;
    sqlx::query("INSERT INTO pages (id, medium_id, media_count) VALUES (100, $1, 1)")
        .bind(existing)
        .execute(&pool)
        .await?;
    sqlx::query(
        "INSERT INTO page_contents (page_id, source_page_id, resource_id, content_type, content_id, position) VALUES (100, 100, $1, 'Medium', $2, 0)",
    )
    .bind(other.id)
    .bind(existing)
    .execute(&pool)
    .await?;

    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write(
        "nodes.tsv",
        &[
            node_row(fish.id, 1, 100, None, "Gadidae"),
            node_row(fish.id, 2, 200, Some(1), "Gadus morhua"),
        ],
    );
    exports.write("node_ancestors.tsv", &[ancestor_row(fish.id, 1, 2, 1, 0)]);
    // An image, then a video, both on page 200.
    exports.write(
        "media.tsv",
        &[medium_row(fish.id, 1, 200, 0), medium_row(fish.id, 2, 200, 1)],
    );

    exports.publisher(&pool).publish(&fish, &exports.repo()).await?;

    let medium = |harv_db_id: i64| {
        let pool = pool.clone();
        let resource_id = fish.id;
        async move {
            sqlx::query_scalar::<_, i64>("SELECT id FROM media WHERE resource_id = $1 AND harv_db_id = $2")
                .bind(resource_id)
                .bind(harv_db_id)
                .fetch_one(&pool)
                .await
                .unwrap()
        }
    };
    let image = medium(1).await;
    let video = medium(2).await;

    let hero = |page: i64| {
        let pool = pool.clone();
        async move {
            sqlx::query_scalar::<_, Option<i64>>("SELECT medium_id FROM pages WHERE id = $1")
                .bind(page)
                .fetch_one(&pool)
                .await
                .unwrap()
        }
    };
    assert_eq!(hero(200).await, Some(image));
    assert_eq!(hero(100).await, Some(existing));

    let positions: Vec<(i64, i64, i32)> = sqlx::query_as(
        "SELECT page_id, content_id, position FROM page_contents WHERE resource_id = $1 ORDER BY page_id, position",
    )
    .bind(fish.id)
    .fetch_all(&pool)
    .await?;
    assert_eq!(
        positions,
        vec![(100, image, 1), (100, video, 2), (200, image, 0), (200, video, 1)]
    );

    let counts: Vec<(i64, i32)> = sqlx::query_as("SELECT id, media_count FROM pages WHERE id IN (100, 200) ORDER BY id")
        .fetch_all(&pool)
        .await?;
    assert_eq!(counts, vec![(100, 3), (200, 2)]);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_republish_without_media_recounts_pages(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write("nodes.tsv", &[node_row(fish.id, 1, 200, None, "Gadus morhua")]);
    let media = exports.write(
        "media.tsv",
        &[medium_row(fish.id, 1, 200, 0), medium_row(fish.id, 2, 200, 0)],
    );

    let media_count = || {
        let pool = pool.clone();
        async move {
            sqlx::query_scalar::<_, i32>("SELECT media_count FROM pages WHERE id = 200")
                .fetch_one(&pool)
                .await
                .unwrap()
        }
    };

    let publisher = exports.publisher(&pool);
    publisher.publish(&fish, &exports.repo()).await?;
    assert_eq!(media_count().await, 2);

    std::fs::remove_file(media)?;
    publisher.publish(&fish, &exports.repo()).await?;

    assert_eq!(media_count().await, 0);
    assert_eq!(count(&pool, "page_contents").await, 0);
    let hero: Option<i64> = sqlx::query_scalar("SELECT medium_id FROM pages WHERE id = 200")
        .fetch_one(&pool)
        .await?;
    assert_eq!(hero, None);

    Ok(())
}

// ============================================================================
// Attribute updates
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_update_attributes_rewrites_changed_rows(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    let mut rows = vec![
        node_row(fish.id, 1, 100, None, "Gadiformes"),
        node_row(fish.id, 2, 101, Some(1), "Gadidae"),
        node_row(fish.id, 3, 102, Some(2), "Gadus"),
    ];
    exports.write("nodes.tsv", &rows);

    let publisher = exports.publisher(&pool);
    publisher.publish(&fish, &exports.repo()).await?;

    rows[1] = rows[1].replace("\tspecies", "\tfamily");
    exports.write("nodes.tsv", &rows);

    let report = publisher
        .update_attributes(&fish, &exports.repo(), EntityType::Node, &["rank".to_string()])
        .await?;
    assert_eq!(report.lines, 3);
    assert_eq!(report.matched, 3);
    assert_eq!(report.changed, 1);

    let ranks: Vec<String> = sqlx::query_scalar("SELECT rank FROM nodes ORDER BY harv_db_id")
        .fetch_all(&pool)
        .await?;
    assert_eq!(ranks, vec!["species", "family", "species"]);

    // Propagated parents survive an attribute-only update.
    let parent: Option<i64> = sqlx::query_scalar("SELECT parent_id FROM nodes WHERE harv_db_id = 3")
        .fetch_one(&pool)
        .await?;
    assert_eq!(parent, Some(node_id(&pool, fish.id, 2).await));

    let warns: Vec<String> = latest_log(&pool, fish.id)
        .await
        .events()
        .await?
        .into_iter()
        .filter(|e| e.category() == Some(EventCategory::Warns))
        .map(|e| e.body)
        .collect();
    assert!(warns.contains(&"3 instances by harv_db_id".to_string()));
    assert!(warns.contains(&"1 changes...".to_string()));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_update_attributes_rejects_unknown_column(pool: PgPool) -> anyhow::Result<()> {
    let fish = resource(&pool, "Fish", "fish").await;
    let exports = Exports::new();
    exports.write("nodes.tsv", &[node_row(fish.id, 1, 100, None, "Gadus")]);

    let err = exports
        .publisher(&pool)
        .update_attributes(&fish, &exports.repo(), EntityType::Node, &["colour".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(find_publish_error(&err), Some(PublishError::UnknownColumn { .. })));
    assert!(nothing_running(&pool).await);

    Ok(())
}
