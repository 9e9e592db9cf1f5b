//! Shared helpers for the SQLite-backed integration tests.

#![allow(dead_code)]

use db_cluster::config::{ClusterConfig, PoolOptions};
use db_cluster::{DbCluster, QueryParam};
use tempfile::NamedTempFile;

/// Create an empty database file that outlives the test's temp handle.
pub fn temp_db_path() -> String {
    let temp_file = NamedTempFile::new().unwrap();
    // Keep the temp file alive - prevent deletion when function returns
    temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

pub fn sqlite_url(path: &str) -> String {
    format!("sqlite:{}", path)
}

/// Run `statements` on `path` through a throwaway writer-only cluster.
pub async fn seed(path: &str, statements: &[&str]) {
    let url = sqlite_url(path);
    let cluster = DbCluster::initialize(ClusterConfig::from_urls(&[&url], &[]).unwrap())
        .await
        .unwrap();
    for sql in statements {
        let result = cluster.execute(sql, &[]).await;
        assert!(result.success(), "seed statement failed: {sql}");
    }
    cluster.shutdown().await;
}

/// A database file holding one row naming the pool it belongs to.
pub async fn named_db(name: &str) -> String {
    let path = temp_db_path();
    seed(
        &path,
        &[
            "CREATE TABLE whoami (name TEXT NOT NULL)",
            &format!("INSERT INTO whoami (name) VALUES ('{name}')"),
        ],
    )
    .await;
    path
}

/// Writer-only cluster over a fresh `users` table.
pub async fn users_cluster() -> (DbCluster, String) {
    users_cluster_with(PoolOptions::default()).await
}

pub async fn users_cluster_with(pool_options: PoolOptions) -> (DbCluster, String) {
    let path = temp_db_path();
    seed(
        &path,
        &["CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, points INTEGER NOT NULL DEFAULT 0)"],
    )
    .await;
    let url = sqlite_url(&path);
    let config = ClusterConfig::from_urls(&[&url], &[])
        .unwrap()
        .with_pool_options(pool_options);
    (DbCluster::initialize(config).await.unwrap(), path)
}

/// Count rows in `users`, always on the writer.
pub async fn user_count(cluster: &DbCluster) -> i64 {
    let result = cluster
        .query_with(
            "SELECT COUNT(*) AS n FROM users",
            &[],
            db_cluster::QueryOptions::default().on_writer(),
        )
        .await;
    result.first_row().unwrap()["n"].as_i64().unwrap()
}

pub fn text(value: &str) -> QueryParam {
    QueryParam::from(value)
}
