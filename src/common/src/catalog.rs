use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Row, query};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::DatabaseConfig;
use crate::model::{
    LogMessage, ProcessLogEntry, ProcessOrigin, ProducingProcess, ScheduleRule, StoredLog,
    StoredLogMessage,
};
use crate::sql::{qualified, quote_ident};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Catalog is not connected yet")]
    Unavailable,

    #[error("Invalid catalog DSN: {0}")]
    InvalidDsn(String),

    #[error("{0} not found in catalog")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Provider folder and filename mask of a raster series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridSource {
    pub provider_uri: String,
    pub mask: String,
}

/// One table of a PostGIS series and the database holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesTable {
    pub data_set_id: i32,
    pub table_name: String,
    pub provider_uri: String,
}

/// Row counts of one historics archival pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoricsOutcome {
    pub archived: u64,
    pub messages_removed: u64,
    pub logs_removed: u64,
}

/// Read access to the orchestrator catalog plus the storage service's own
/// operational log tables.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Semantic code of a data series, e.g. `GRID-geotiff`.
    async fn semantics_code(&self, data_series_id: i32) -> Result<Option<String>>;

    async fn project_active(&self, project_id: i32) -> Result<Option<bool>>;

    async fn schedule(&self, schedule_id: i32) -> Result<Option<ScheduleRule>>;

    async fn provider_uri(&self, data_provider_id: i32) -> Result<Option<String>>;

    /// Provider uri of the provider a data series is read from.
    async fn series_provider_uri(&self, data_series_id: i32) -> Result<Option<String>>;

    async fn grid_source(&self, data_series_id: i32) -> Result<Option<GridSource>>;

    /// Tables listed under the `table_name` dataset format, ordered by dataset.
    async fn series_tables(&self, data_series_id: i32) -> Result<Vec<SeriesTable>>;

    async fn data_set_format(&self, data_set_id: i32, key: &str) -> Result<Option<String>>;

    async fn producing_process(&self, data_series_id: i32) -> Result<Option<ProducingProcess>>;

    /// Create `storage_<instance>` and its messages table if missing.
    async fn ensure_log_tables(&self, service_instance_id: i32) -> Result<()>;

    /// Append a run row and return its id.
    async fn insert_log(&self, service_instance_id: i32, entry: &ProcessLogEntry) -> Result<i32>;

    async fn insert_log_message(&self, service_instance_id: i32, message: &LogMessage)
    -> Result<()>;

    /// Move a producer's log rows into `storage_historics`.
    async fn archive_history(
        &self,
        storage_id: i32,
        producer: &ProducingProcess,
    ) -> Result<HistoricsOutcome>;

    /// Newest-first page of a process's run rows, each with its messages.
    async fn process_logs(
        &self,
        service_instance_id: i32,
        process_id: i32,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<StoredLog>>;
}

/// Opens catalog connections, e.g. after UPDATE_SERVICE delivers credentials.
#[async_trait]
pub trait CatalogConnector: Send + Sync {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn Catalog>>;
}

/// Swappable reference to the live catalog connection.
#[derive(Default)]
pub struct CatalogHandle {
    current: RwLock<Option<Arc<dyn Catalog>>>,
}

impl CatalogHandle {
    pub fn new(catalog: Option<Arc<dyn Catalog>>) -> Self {
        Self {
            current: RwLock::new(catalog),
        }
    }

    pub async fn current(&self) -> Result<Arc<dyn Catalog>> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(CatalogError::Unavailable)
    }

    pub async fn replace(&self, catalog: Arc<dyn Catalog>) {
        *self.current.write().await = Some(catalog);
    }

    pub async fn is_connected(&self) -> bool {
        self.current.read().await.is_some()
    }
}

/// PostgreSQL catalog scoped to one schema.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
    schema: String,
}

impl PgCatalog {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let dsn = config
            .dsn()
            .map_err(|e| CatalogError::InvalidDsn(e.to_string()))?;
        log::info!(
            "Connecting to catalog database {}@{}:{}/{}",
            config.user,
            config.host,
            config.port,
            config.name
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&dsn)
            .await
            .map_err(|e| {
                log::error!("Failed to connect to catalog database: {e}");
                e
            })?;

        log::info!("Catalog connection established");
        Ok(Self::from_pool(pool, &config.schema))
    }

    pub fn from_pool(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }

    fn table(&self, name: &str) -> String {
        qualified(&self.schema, name)
    }

    fn log_tables(&self, service_instance_id: i32) -> (String, String) {
        let log = format!("storage_{service_instance_id}");
        let messages = format!("{log}_messages");
        (log, messages)
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn semantics_code(&self, data_series_id: i32) -> Result<Option<String>> {
        let sql = format!(
            "SELECT s.code FROM {} ds JOIN {} s ON s.id = ds.data_series_semantics_id \
             WHERE ds.id = $1",
            self.table("data_series"),
            self.table("data_series_semantics"),
        );
        let row = query(&sql)
            .bind(data_series_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("code")).transpose()?)
    }

    async fn project_active(&self, project_id: i32) -> Result<Option<bool>> {
        let sql = format!("SELECT active FROM {} WHERE id = $1", self.table("projects"));
        let row = query(&sql)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("active")).transpose()?)
    }

    async fn schedule(&self, schedule_id: i32) -> Result<Option<ScheduleRule>> {
        let sql = format!(
            "SELECT id, frequency, frequency_unit, frequency_start_time::text AS frequency_start_time, \
             schedule, schedule_unit, schedule_time::text AS schedule_time \
             FROM {} WHERE id = $1",
            self.table("schedules"),
        );
        let row = query(&sql)
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ScheduleRule {
            id: row.try_get("id")?,
            frequency: row.try_get("frequency")?,
            frequency_unit: row.try_get("frequency_unit")?,
            frequency_start_time: row.try_get("frequency_start_time")?,
            schedule: row.try_get("schedule")?,
            schedule_unit: row.try_get("schedule_unit")?,
            schedule_time: row.try_get("schedule_time")?,
        }))
    }

    async fn provider_uri(&self, data_provider_id: i32) -> Result<Option<String>> {
        let sql = format!(
            "SELECT uri FROM {} WHERE id = $1",
            self.table("data_providers")
        );
        let row = query(&sql)
            .bind(data_provider_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("uri")).transpose()?)
    }

    async fn series_provider_uri(&self, data_series_id: i32) -> Result<Option<String>> {
        let sql = format!(
            "SELECT dp.uri FROM {} ds JOIN {} dp ON dp.id = ds.data_provider_id \
             WHERE ds.id = $1",
            self.table("data_series"),
            self.table("data_providers"),
        );
        let row = query(&sql)
            .bind(data_series_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("uri")).transpose()?)
    }

    async fn grid_source(&self, data_series_id: i32) -> Result<Option<GridSource>> {
        let sql = format!(
            "SELECT dp.uri, f.value FROM {} ds \
             JOIN {} dp ON dp.id = ds.data_provider_id \
             JOIN {} d ON d.data_series_id = ds.id \
             JOIN {} f ON f.data_set_id = d.id AND f.key = 'mask' \
             WHERE ds.id = $1 ORDER BY d.id LIMIT 1",
            self.table("data_series"),
            self.table("data_providers"),
            self.table("data_sets"),
            self.table("data_set_formats"),
        );
        let row = query(&sql)
            .bind(data_series_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(GridSource {
                provider_uri: row.try_get("uri")?,
                mask: row.try_get("value")?,
            })),
            None => Ok(None),
        }
    }

    async fn series_tables(&self, data_series_id: i32) -> Result<Vec<SeriesTable>> {
        let sql = format!(
            "SELECT d.id, f.value, dp.uri FROM {} ds \
             JOIN {} dp ON dp.id = ds.data_provider_id \
             JOIN {} d ON d.data_series_id = ds.id \
             JOIN {} f ON f.data_set_id = d.id AND f.key = 'table_name' \
             WHERE ds.id = $1 ORDER BY d.id",
            self.table("data_series"),
            self.table("data_providers"),
            self.table("data_sets"),
            self.table("data_set_formats"),
        );
        let rows = query(&sql)
            .bind(data_series_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SeriesTable {
                    data_set_id: row.try_get("id")?,
                    table_name: row.try_get("value")?,
                    provider_uri: row.try_get("uri")?,
                })
            })
            .collect()
    }

    async fn data_set_format(&self, data_set_id: i32, key: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT value FROM {} WHERE data_set_id = $1 AND key = $2",
            self.table("data_set_formats")
        );
        let row = query(&sql)
            .bind(data_set_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    async fn producing_process(&self, data_series_id: i32) -> Result<Option<ProducingProcess>> {
        let collector = format!(
            "SELECT id, service_instance_id FROM {} WHERE data_series_output = $1 \
             ORDER BY id LIMIT 1",
            self.table("collectors")
        );
        if let Some(row) = query(&collector)
            .bind(data_series_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Some(ProducingProcess {
                origin: ProcessOrigin::Collector,
                process_id: row.try_get("id")?,
                service_instance_id: row.try_get("service_instance_id")?,
            }));
        }

        let analysis = format!(
            "SELECT a.id, a.instance_id FROM {} a JOIN {} d ON d.id = a.dataset_output \
             WHERE d.data_series_id = $1 ORDER BY a.id LIMIT 1",
            self.table("analysis"),
            self.table("data_sets"),
        );
        let row = query(&analysis)
            .bind(data_series_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(ProducingProcess {
                origin: ProcessOrigin::Analysis,
                process_id: row.try_get("id")?,
                service_instance_id: row.try_get("instance_id")?,
            })),
            None => Ok(None),
        }
    }

    async fn ensure_log_tables(&self, service_instance_id: i32) -> Result<()> {
        let (log, messages) = self.log_tables(service_instance_id);

        let create_log = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id SERIAL NOT NULL,
                process_id INTEGER NOT NULL,
                status INTEGER NOT NULL,
                start_timestamp TIMESTAMP(1) WITH TIME ZONE,
                data_timestamp TIMESTAMP WITH TIME ZONE,
                last_process_timestamp TIMESTAMP(1) WITH TIME ZONE,
                data TEXT,
                CONSTRAINT {} PRIMARY KEY (id)
            )"#,
            self.table(&log),
            quote_ident(&format!("{log}_pk")),
        );
        query(&create_log).execute(&self.pool).await?;

        let create_messages = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id SERIAL NOT NULL,
                log_id INTEGER NOT NULL,
                type INTEGER NOT NULL,
                description TEXT,
                "timestamp" TIMESTAMP(1) WITH TIME ZONE,
                CONSTRAINT {} PRIMARY KEY (id),
                CONSTRAINT {} FOREIGN KEY (log_id)
                    REFERENCES {} (id) MATCH SIMPLE
                    ON UPDATE NO ACTION ON DELETE NO ACTION
            )"#,
            self.table(&messages),
            quote_ident(&format!("{messages}_pk")),
            quote_ident(&format!("{messages}_fk")),
            self.table(&log),
        );
        query(&create_messages).execute(&self.pool).await?;

        Ok(())
    }

    async fn insert_log(&self, service_instance_id: i32, entry: &ProcessLogEntry) -> Result<i32> {
        let (log, _) = self.log_tables(service_instance_id);
        let sql = format!(
            "INSERT INTO {} (process_id, status, start_timestamp, data_timestamp, \
             last_process_timestamp, data) VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            self.table(&log)
        );
        let row = query(&sql)
            .bind(entry.process_id)
            .bind(entry.status.code())
            .bind(entry.start_timestamp)
            .bind(entry.data_timestamp)
            .bind(entry.last_process_timestamp)
            .bind(entry.data_payload())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn insert_log_message(
        &self,
        service_instance_id: i32,
        message: &LogMessage,
    ) -> Result<()> {
        let (_, messages) = self.log_tables(service_instance_id);
        let sql = format!(
            r#"INSERT INTO {} (log_id, type, description, "timestamp") VALUES ($1, $2, $3, $4)"#,
            self.table(&messages)
        );
        query(&sql)
            .bind(message.log_id)
            .bind(message.status.code())
            .bind(&message.description)
            .bind(message.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn archive_history(
        &self,
        storage_id: i32,
        producer: &ProducingProcess,
    ) -> Result<HistoricsOutcome> {
        let source = producer.log_table();
        let source_log = self.table(&source);
        let source_messages = self.table(&format!("{source}_messages"));
        let historics = self.table("storage_historics");

        let mut tx = self.pool.begin().await?;

        let with_messages = format!(
            "INSERT INTO {historics} (process_id, status, start_timestamp, data_timestamp, \
             last_process_timestamp, data, origin, type, description, storage_id) \
             SELECT a.process_id, a.status, a.start_timestamp, a.data_timestamp, \
             a.last_process_timestamp, a.data, $2, b.type, b.description, $3 \
             FROM {source_log} a JOIN {source_messages} b ON b.log_id = a.id \
             WHERE a.process_id = $1"
        );
        let mut archived = query(&with_messages)
            .bind(producer.process_id)
            .bind(producer.origin_tag())
            .bind(storage_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if archived == 0 {
            // no messages means the producer never failed; keep the bare runs
            let bare = format!(
                "INSERT INTO {historics} (process_id, status, start_timestamp, data_timestamp, \
                 last_process_timestamp, data, origin, storage_id) \
                 SELECT a.process_id, a.status, a.start_timestamp, a.data_timestamp, \
                 a.last_process_timestamp, a.data, $2, $3 \
                 FROM {source_log} a WHERE a.process_id = $1"
            );
            archived = query(&bare)
                .bind(producer.process_id)
                .bind(producer.origin_tag())
                .bind(storage_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        let remove_messages = format!(
            "DELETE FROM {source_messages} b USING {source_log} a \
             WHERE a.id = b.log_id AND a.process_id = $1"
        );
        let messages_removed = query(&remove_messages)
            .bind(producer.process_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let remove_logs = format!("DELETE FROM {source_log} WHERE process_id = $1");
        let logs_removed = query(&remove_logs)
            .bind(producer.process_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(HistoricsOutcome {
            archived,
            messages_removed,
            logs_removed,
        })
    }
    async fn process_logs(
        &self,
        service_instance_id: i32,
        process_id: i32,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<StoredLog>> {
        self.ensure_log_tables(service_instance_id).await?;
        let (log, messages) = self.log_tables(service_instance_id);

        let select_logs = format!(
            "SELECT id, process_id, status, start_timestamp, data_timestamp, \
             last_process_timestamp, data FROM {} WHERE process_id = $1 \
             ORDER BY id DESC LIMIT $2 OFFSET $3",
            self.table(&log)
        );
        let rows = query(&select_logs)
            .bind(process_id)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in rows {
            logs.push(StoredLog {
                id: row.try_get("id")?,
                process_id: row.try_get("process_id")?,
                status: row.try_get("status")?,
                start_timestamp: row.try_get("start_timestamp")?,
                data_timestamp: row.try_get("data_timestamp")?,
                last_process_timestamp: row.try_get("last_process_timestamp")?,
                data: row.try_get("data")?,
                messages: Vec::new(),
            });
        }
        if logs.is_empty() {
            return Ok(logs);
        }

        let log_ids: Vec<i32> = logs.iter().map(|l| l.id).collect();
        let select_messages = format!(
            "SELECT id, log_id, type, description, \"timestamp\" FROM {} \
             WHERE log_id = ANY($1) ORDER BY id",
            self.table(&messages)
        );
        let rows = query(&select_messages)
            .bind(&log_ids)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let message = StoredLogMessage {
                id: row.try_get("id")?,
                log_id: row.try_get("log_id")?,
                status: row.try_get("type")?,
                description: row.try_get("description")?,
                timestamp: row.try_get("timestamp")?,
            };
            if let Some(log) = logs.iter_mut().find(|l| l.id == message.log_id) {
                log.messages.push(message);
            }
        }
        log::debug!(
            "Read {} log rows of process {process_id} from {log}",
            logs.len()
        );
        Ok(logs)
    }
}

/// Connects [`PgCatalog`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgCatalogConnector;

#[async_trait]
impl CatalogConnector for PgCatalogConnector {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn Catalog>> {
        let catalog = PgCatalog::connect(config).await?;
        Ok(Arc::new(catalog))
    }
}
