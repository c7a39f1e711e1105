//! Common fixtures for publishing integration tests
//!
//! Exports are written to a temp directory and served through a
//! [`LocalRepo`]; staged copies go to a separate temp directory so tests can
//! check what cleanup left behind.

#![allow(dead_code)]

use publish_server::publishing::{LocalRepo, PublishConfig, Publisher, Resource};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A harvester export directory plus a staging directory
pub struct Exports {
    exports: TempDir,
    staging: TempDir,
}

impl Exports {
    pub fn new() -> Self {
        Self {
            exports: tempfile::tempdir().expect("Failed to create export dir"),
            staging: tempfile::tempdir().expect("Failed to create staging dir"),
        }
    }

    /// Write `rows` as a TSV export, one line each, newline-terminated.
    pub fn write(&self, file: &str, rows: &[String]) -> PathBuf {
        let mut content = rows.join("\n");
        content.push('\n');
        self.write_raw(file, &content)
    }

    pub fn write_raw(&self, file: &str, content: &str) -> PathBuf {
        let path = self.exports.path().join(file);
        std::fs::write(&path, content).expect("Failed to write export");
        path
    }

    pub fn repo(&self) -> LocalRepo {
        LocalRepo::new(self.exports.path())
    }

    pub fn staging(&self) -> &Path {
        self.staging.path()
    }

    pub fn config(&self) -> PublishConfig {
        PublishConfig {
            tmp_dir: self.staging.path().to_path_buf(),
            ..PublishConfig::default()
        }
    }

    pub fn publisher(&self, pool: &PgPool) -> Publisher {
        Publisher::new(pool.clone(), self.config())
    }
}

pub async fn resource(pool: &PgPool, name: &str, path: &str) -> Resource {
    Resource::create(pool, name, path, false)
        .await
        .expect("Failed to create resource")
}

/// `nodes.tsv` line: resource_id, harv_db_id, page_id, parent_id,
/// resource_pk, scientific_name, canonical_form, rank.
pub fn node_row(resource_id: i64, harv_db_id: i64, page_id: i64, parent: Option<i64>, name: &str) -> String {
    format!(
        "{}\t{}\t{}\t{}\tpk-{}\t{}\t{}\tspecies",
        resource_id,
        harv_db_id,
        page_id,
        parent.map(|p| p.to_string()).unwrap_or_else(|| "\\N".to_string()),
        harv_db_id,
        name,
        name
    )
}

/// `media.tsv` line with the given subclass (0 = image).
pub fn medium_row(resource_id: i64, harv_db_id: i64, page_id: i64, subclass: i16) -> String {
    format!(
        "{}\t{}\t{}\t\\N\tmedium-{}\tguid-{}\t{}\tjpg\tMedium {}\t\\N\t\\N\t\\N\t\\N\tcc-by",
        resource_id, harv_db_id, page_id, harv_db_id, harv_db_id, subclass, harv_db_id
    )
}

/// `node_ancestors.tsv` line; ids are harvest ids.
pub fn ancestor_row(resource_id: i64, harv_db_id: i64, node: i64, ancestor: i64, depth: i32) -> String {
    format!(
        "{}\t{}\t{}\t{}\tpk-{}\tpk-{}\t{}",
        resource_id, harv_db_id, node, ancestor, node, ancestor, depth
    )
}

/// `vernaculars.tsv` line; `node` is a harvest id.
pub fn vernacular_row(resource_id: i64, harv_db_id: i64, node: i64, page_id: i64, string: &str) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\ten\tf",
        resource_id, harv_db_id, node, page_id, string
    )
}

/// `traits.tsv` line.
pub fn trait_row(resource_id: i64, eol_pk: &str, page_id: i64) -> String {
    format!(
        "{}\t{}\t{}\thttp://purl.obolibrary.org/obo/RO_0002303\thttp://purl.obolibrary.org/obo/ENVO_00000447\t\\N\t\\N\t\\N\tsource",
        resource_id, eol_pk, page_id
    )
}

/// Production id of a node by harvest id.
pub async fn node_id(pool: &PgPool, resource_id: i64, harv_db_id: i64) -> i64 {
    sqlx::query_scalar("SELECT id FROM nodes WHERE resource_id = $1 AND harv_db_id = $2")
        .bind(resource_id)
        .bind(harv_db_id)
        .fetch_one(pool)
        .await
        .expect("Node not found")
}

pub async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(sqlx::AssertSqlSafe(format!(r#"SELECT COUNT(*) FROM "{}""#, table)))
        .fetch_one(pool)
        .await
        .expect("Failed to count rows")
}
