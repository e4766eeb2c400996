use std::path::Path;
use std::sync::Arc;

use ndb_pool::memory::{Catalog, MemoryDriver};
use ndb_pool::stats::{ConnectionStatsSnapshot, PoolStatsSnapshot};
use ndb_pool::{ConnectionPool, ConnectionRegistry, DefaultValue, PoolProperties, TableMetadata};
use serde::Serialize;

pub type Pool = ConnectionPool<MemoryDriver>;

/// Build and connect a pool from optional property and catalog files.
pub async fn open(config: Option<&Path>, catalog: Option<&Path>) -> anyhow::Result<Pool> {
    let properties = match config {
        Some(path) => PoolProperties::from_file(path)?,
        None => PoolProperties::default(),
    };
    let catalog = match catalog {
        Some(path) => Catalog::from_file(path)?,
        None => Catalog::default(),
    };
    tracing::debug!(tables = catalog.tables.len(), "catalog loaded");

    let registry = Arc::new(ConnectionRegistry::new(Arc::new(MemoryDriver::new(catalog))));
    let pool = ConnectionPool::new(properties, registry)?;
    pool.connect().await?;
    Ok(pool)
}

pub async fn list_tables(pool: &Pool, db: Option<&str>, format: &str) -> anyhow::Result<String> {
    let database = db.unwrap_or(&pool.properties().database);
    let tables = pool.list_tables(database, None).await?;
    match format {
        "json" => Ok(serde_json::to_string_pretty(&*tables)?),
        _ => Ok(tables.join("\n")),
    }
}

pub async fn describe(pool: &Pool, table: &str, db: Option<&str>, format: &str) -> anyhow::Result<String> {
    let database = db.unwrap_or(&pool.properties().database);
    let metadata = pool.get_table_metadata(database, table, None).await?;
    match format {
        "json" => Ok(serde_json::to_string_pretty(&*metadata)?),
        _ => Ok(format_table(&metadata)),
    }
}

fn format_table(table: &TableMetadata) -> String {
    let mut out = format!("{}\n", table.qualified_name());
    for column in &table.columns {
        let column_type = serde_json::to_value(&column.column_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let default = match &column.default {
            DefaultValue::Value(value) => serde_json::to_string(value).unwrap_or_default(),
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::Undefined => "-".to_string(),
        };
        out.push_str(&format!(
            "  {:<20} {:<14} {:<8} {:<3} {}\n",
            column.name,
            column_type,
            if column.nullable { "null" } else { "not null" },
            if column.primary_key { "pk" } else { "" },
            default,
        ));
    }
    out.trim_end().to_string()
}

#[derive(Serialize)]
struct StatsReport {
    pool: PoolStatsSnapshot,
    connection: Option<ConnectionStatsSnapshot>,
    free_sessions: usize,
}

pub async fn stats(pool: &Pool) -> anyhow::Result<String> {
    pool.prefetch_complete().await;
    let report = StatsReport {
        pool: pool.stats(),
        connection: pool.connection_stats(),
        free_sessions: pool.free_sessions(),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG: &str = r#"
[[tables]]
database = "shop"
name = "orders"

[[tables.columns]]
name = "id"
column_type = "bigint"
primary_key = true

[[tables.columns]]
name = "note"
column_type = "varchar"
nullable = true
length = 64

[[tables]]
database = "shop"
name = "customers"
"#;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    async fn shop_pool() -> (Pool, tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let config = write_temp("database = \"shop\"\nsession_pool_min = 1\n");
        let catalog = write_temp(CATALOG);
        let pool = open(Some(config.path()), Some(catalog.path())).await.unwrap();
        (pool, config, catalog)
    }

    #[tokio::test]
    async fn list_tables_text_and_json() {
        let (pool, _config, _catalog) = shop_pool().await;

        assert_eq!(list_tables(&pool, None, "text").await.unwrap(), "orders\ncustomers");
        let json: Vec<String> =
            serde_json::from_str(&list_tables(&pool, Some("shop"), "json").await.unwrap()).unwrap();
        assert_eq!(json, vec!["orders", "customers"]);
    }

    #[tokio::test]
    async fn describe_shows_columns() {
        let (pool, _config, _catalog) = shop_pool().await;
        let text = describe(&pool, "orders", None, "text").await.unwrap();
        assert!(text.starts_with("shop.orders"));
        assert!(text.contains("bigint"));
        assert!(text.contains("NULL"));

        let json: serde_json::Value =
            serde_json::from_str(&describe(&pool, "orders", None, "json").await.unwrap()).unwrap();
        assert_eq!(json["columns"][0]["name"], "id");
    }

    #[tokio::test]
    async fn describe_missing_table_fails() {
        let (pool, _config, _catalog) = shop_pool().await;
        let err = describe(&pool, "nope", None, "text").await.unwrap_err();
        assert!(err.to_string().contains("723"));
    }

    #[tokio::test]
    async fn stats_report_is_json() {
        let (pool, _config, _catalog) = shop_pool().await;
        let json: serde_json::Value = serde_json::from_str(&stats(&pool).await.unwrap()).unwrap();
        assert_eq!(json["free_sessions"], 1);
        assert_eq!(json["connection"]["node_id"], 49);
    }

    #[tokio::test]
    async fn missing_config_file_fails() {
        let err = open(Some(Path::new("/nonexistent/pool.toml")), None).await.unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }
}
