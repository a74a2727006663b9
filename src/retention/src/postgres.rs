//! PostGIS-backed dataset stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::sql::{quote_ident, quote_table, split_table};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Row, query};
use tokio::sync::Mutex;

use crate::dataset::{
    ColumnDef, DatasetConnector, DatasetStore, DeletedRow, DeletedRows, GeometryInfo, PrimaryKey,
    SequenceDef, TableLayout, sequence_name_from_default,
};
use crate::error::{RetentionError, Result};

const TIMESTAMP_ALIAS: &str = "__retention_ts";

pub struct PgDatasetStore {
    pool: PgPool,
}

impl PgDatasetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn has_geometry_columns(&self) -> Result<bool> {
        let row = query("SELECT to_regclass('geometry_columns') IS NOT NULL AS present")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn geometries(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<HashMap<String, GeometryInfo>> {
        if !self.has_geometry_columns().await? {
            return Ok(HashMap::new());
        }
        let rows = query(
            "SELECT f_geometry_column::text AS name, type::text AS geometry_type, srid \
             FROM geometry_columns \
             WHERE f_table_schema = COALESCE($1, current_schema()) AND f_table_name = $2",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("name")?,
                    GeometryInfo {
                        geometry_type: row.try_get("geometry_type")?,
                        srid: row.try_get("srid")?,
                    },
                ))
            })
            .collect()
    }

    async fn primary_key(&self, schema: Option<&str>, table: &str) -> Result<Option<PrimaryKey>> {
        let rows = query(
            "SELECT tc.constraint_name::text AS constraint_name, kcu.column_name::text AS column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON kcu.constraint_name = tc.constraint_name \
              AND kcu.table_schema = tc.table_schema \
              AND kcu.table_name = tc.table_name \
             WHERE tc.constraint_type = 'PRIMARY KEY' \
               AND tc.table_schema = COALESCE($1, current_schema()) AND tc.table_name = $2 \
             ORDER BY kcu.ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut primary_key: Option<PrimaryKey> = None;
        for row in rows {
            let constraint_name: String = row.try_get("constraint_name")?;
            let column: String = row.try_get("column_name")?;
            primary_key
                .get_or_insert_with(|| PrimaryKey {
                    constraint_name,
                    columns: Vec::new(),
                })
                .columns
                .push(column);
        }
        Ok(primary_key)
    }

    async fn sequence(&self, name: &str) -> Result<Option<SequenceDef>> {
        let row = query(
            "SELECT increment::text AS increment, minimum_value::text AS min_value, \
             maximum_value::text AS max_value, start_value::text AS start_value \
             FROM information_schema.sequences WHERE sequence_name = $1 LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let number = |column: &str| -> Result<i64> {
            let text: String = row.try_get(column)?;
            text.parse().map_err(|_| {
                RetentionError::MissingMetadata(format!("sequence {name} {column} '{text}'"))
            })
        };
        Ok(Some(SequenceDef {
            name: name.to_string(),
            increment: number("increment")?,
            min_value: number("min_value")?,
            max_value: number("max_value")?,
            start_value: number("start_value")?,
        }))
    }
}

#[async_trait]
impl DatasetStore for PgDatasetStore {
    async fn describe(&self, table: &str) -> Result<TableLayout> {
        let (schema, bare) = split_table(table);
        let rows = query(
            "SELECT column_name::text AS name, data_type::text AS data_type, \
             udt_name::text AS udt_name, character_maximum_length::int4 AS character_maximum_length, \
             is_nullable = 'YES' AS is_nullable, column_default::text AS column_default \
             FROM information_schema.columns \
             WHERE table_schema = COALESCE($1, current_schema()) AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(bare)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(RetentionError::EmptyTable(table.to_string()));
        }

        let mut geometries = self.geometries(schema, bare).await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            columns.push(ColumnDef {
                geometry: geometries.remove(&name),
                name,
                data_type: row.try_get("data_type")?,
                udt_name: row.try_get("udt_name")?,
                character_maximum_length: row.try_get("character_maximum_length")?,
                is_nullable: row.try_get("is_nullable")?,
                column_default: row.try_get("column_default")?,
            });
        }

        let sequence_name = columns
            .iter()
            .filter_map(|c| c.column_default.as_deref())
            .find_map(sequence_name_from_default);
        let sequence = match sequence_name {
            Some(name) => self.sequence(&name).await?,
            None => None,
        };

        Ok(TableLayout {
            table: table.to_string(),
            columns,
            primary_key: self.primary_key(schema, bare).await?,
            sequence,
        })
    }

    async fn delete_older_than(
        &self,
        table: &str,
        timestamp_column: &str,
        cutoff: DateTime<Utc>,
        returning: &[String],
    ) -> Result<DeletedRows> {
        let mut projection = vec![format!(
            "{}::timestamptz AS {TIMESTAMP_ALIAS}",
            quote_ident(timestamp_column)
        )];
        projection.extend(
            returning
                .iter()
                .map(|c| format!("{}::text AS {}", quote_ident(c), quote_ident(c))),
        );
        let sql = format!(
            "DELETE FROM {} WHERE {} < $1 RETURNING {}",
            quote_table(table),
            quote_ident(timestamp_column),
            projection.join(", ")
        );

        let rows = query(&sql).bind(cutoff).fetch_all(&self.pool).await?;

        let mut deleted = DeletedRows {
            columns: returning.to_vec(),
            rows: Vec::with_capacity(rows.len()),
        };
        for row in rows {
            let mut values = Vec::with_capacity(returning.len());
            for column in returning {
                values.push(row.try_get::<Option<String>, _>(column.as_str())?);
            }
            deleted.rows.push(DeletedRow {
                timestamp: row.try_get(TIMESTAMP_ALIAS)?,
                values,
            });
        }
        Ok(deleted)
    }

    async fn ensure_table(&self, layout: &TableLayout) -> Result<()> {
        if let Some(sql) = layout.create_sequence_sql() {
            query(&sql).execute(&self.pool).await?;
        }
        query(&layout.create_table_sql()).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_rows(&self, layout: &TableLayout, rows: &DeletedRows) -> Result<u64> {
        let sql = layout.insert_sql(&rows.columns);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for row in &rows.rows {
            let mut statement = query(&sql);
            for value in &row.values {
                statement = statement.bind(value.as_deref());
            }
            inserted += statement.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

/// Opens one pool per provider uri and reuses it across runs.
pub struct PgDatasetConnector {
    max_connections: u32,
    acquire_timeout: Duration,
    pools: Mutex<HashMap<String, PgPool>>,
}

impl PgDatasetConnector {
    pub fn new(max_connections: u32, acquire_timeout: Duration) -> Self {
        Self {
            max_connections,
            acquire_timeout,
            pools: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for PgDatasetConnector {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10))
    }
}

/// Provider uris use `postgis://`; the driver only speaks `postgres://`.
pub fn postgres_url(uri: &str) -> Result<String> {
    let invalid = |message: String| RetentionError::InvalidUri {
        uri: uri.to_string(),
        message,
    };
    let mut url = url::Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "postgres" | "postgresql" => {}
        "postgis" => url
            .set_scheme("postgres")
            .map_err(|_| invalid("cannot rewrite scheme".to_string()))?,
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    }
    Ok(url.to_string())
}

fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        Err(_) => "<invalid>".to_string(),
    }
}

#[async_trait]
impl DatasetConnector for PgDatasetConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn DatasetStore>> {
        let cached = self.pools.lock().await.get(uri).cloned();
        if let Some(pool) = cached {
            return Ok(Arc::new(PgDatasetStore::new(pool)));
        }

        // the pool map stays unlocked while connecting
        let url = postgres_url(uri)?;
        tracing::debug!("Opening dataset pool for provider {}", redact(&url));
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&url)
            .await?;

        let pool = self
            .pools
            .lock()
            .await
            .entry(uri.to_string())
            .or_insert(pool)
            .clone();
        Ok(Arc::new(PgDatasetStore::new(pool)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgis_scheme_is_rewritten() {
        assert_eq!(
            postgres_url("postgis://user:pw@db:5432/terrama2").unwrap(),
            "postgres://user:pw@db:5432/terrama2"
        );
        assert_eq!(
            postgres_url("postgres://db/x").unwrap(),
            "postgres://db/x"
        );
        assert_eq!(
            redact("postgres://user:pw@db/x"),
            "postgres://user@db/x"
        );
        assert!(matches!(
            postgres_url("file:///tmp/data"),
            Err(RetentionError::InvalidUri { .. })
        ));
    }

    #[tokio::test]
    async fn test_cached_pool_not_blocked_by_pending_connect() {
        let connector = Arc::new(PgDatasetConnector::new(1, Duration::from_secs(3)));
        let cached = "postgis://postgres@cached:5432/grid";
        let lazy = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@cached:5432/grid")
            .unwrap();
        connector.pools.lock().await.insert(cached.to_string(), lazy);

        let pending = {
            let connector = connector.clone();
            tokio::spawn(async move {
                connector
                    .connect("postgis://postgres@10.255.255.1:5432/unreachable")
                    .await
                    .is_ok()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reused = tokio::time::timeout(Duration::from_millis(500), connector.connect(cached))
            .await
            .expect("cached pool waited on another connect");
        assert!(reused.is_ok());
        pending.abort();
    }
}
