//! One retention run of one storage, from dispatch to the operational log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use common::model::{LogMessage, ProcessLogEntry, SeriesKind, StatusLog, StorageDefinition};
use common::{Catalog, CatalogHandle};
use tracing::{debug, error, info, warn};

use crate::cutoff::compute_cutoff;
use crate::dataset::DatasetConnector;
use crate::error::{RetentionError, Result};
use crate::raster::run_file_retention;
use crate::table::run_table_retention;

/// Description of a run that found nothing eligible.
pub const NO_DATA: &str = "No data to process";

/// What an executor reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: StatusLog,
    pub data_timestamp: Option<DateTime<Utc>>,
    pub description: String,
}

impl RunOutcome {
    pub fn no_data() -> Self {
        Self {
            status: StatusLog::Done,
            data_timestamp: None,
            description: NO_DATA.to_string(),
        }
    }

    fn failed(error: &RetentionError) -> Self {
        Self {
            status: StatusLog::Error,
            data_timestamp: None,
            description: error.to_string(),
        }
    }
}

/// Summary of a finished run, as reported to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub storage_id: i32,
    pub status: StatusLog,
    /// false when the executor failed
    pub result: bool,
    pub data_timestamp: Option<DateTime<Utc>>,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Runs storages against the current catalog and dataset databases.
pub struct RetentionRunner {
    catalog: Arc<CatalogHandle>,
    datasets: Arc<dyn DatasetConnector>,
    kinds: Mutex<HashMap<i32, SeriesKind>>,
}

impl RetentionRunner {
    pub fn new(catalog: Arc<CatalogHandle>, datasets: Arc<dyn DatasetConnector>) -> Self {
        Self {
            catalog,
            datasets,
            kinds: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one run. Failures never escape: they become an `Error` status
    /// in the report and in the operational log.
    pub async fn run(&self, storage: &StorageDefinition) -> RunReport {
        let started_at = Utc::now();
        info!(storage_id = storage.id, name = %storage.name, "Starting retention run");

        let outcome = match self.catalog.current().await {
            Ok(catalog) => {
                let outcome = self
                    .execute(catalog.as_ref(), storage, started_at)
                    .await
                    .unwrap_or_else(|e| {
                        error!(storage_id = storage.id, error = %e, "Retention run failed");
                        RunOutcome::failed(&e)
                    });
                let finished_at = Utc::now();
                if let Err(e) =
                    write_log(catalog.as_ref(), storage, &outcome, started_at, finished_at).await
                {
                    error!(storage_id = storage.id, error = %e, "Failed to write storage log");
                }
                outcome
            }
            Err(e) => {
                error!(storage_id = storage.id, error = %e, "Retention run without catalog");
                RunOutcome::failed(&RetentionError::from(e))
            }
        };

        let report = RunReport {
            storage_id: storage.id,
            status: outcome.status,
            result: outcome.status != StatusLog::Error,
            data_timestamp: outcome.data_timestamp,
            description: outcome.description,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            storage_id = storage.id,
            result = report.result,
            description = %report.description,
            "Retention run finished"
        );
        report
    }

    async fn execute(
        &self,
        catalog: &dyn Catalog,
        storage: &StorageDefinition,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        let kind = self.series_kind(catalog, storage).await?;
        let cutoff = compute_cutoff(now, storage.effective_keep_data(), &storage.keep_data_unit)?;
        debug!(
            storage_id = storage.id,
            cutoff = %cutoff.cutoff_timestamp,
            erase_all = cutoff.erase_all,
            "Computed retention cutoff"
        );

        if storage.filter {
            archive_historics(catalog, storage).await;
        }

        match kind {
            SeriesKind::GridFiles => run_file_retention(storage, catalog, &cutoff, now).await,
            SeriesKind::SingleTable
            | SeriesKind::MultiTable
            | SeriesKind::AnalysisMonitoredObject => {
                run_table_retention(storage, kind, catalog, self.datasets.as_ref(), &cutoff).await
            }
        }
    }

    /// Semantic family of the storage's series, looked up once per storage.
    async fn series_kind(
        &self,
        catalog: &dyn Catalog,
        storage: &StorageDefinition,
    ) -> Result<SeriesKind> {
        if let Some(kind) = self.cached_kind(storage.id) {
            return Ok(kind);
        }

        let code = catalog
            .semantics_code(storage.data_series_id)
            .await?
            .ok_or_else(|| {
                RetentionError::MissingMetadata(format!(
                    "semantics of data series {}",
                    storage.data_series_id
                ))
            })?;
        let kind = SeriesKind::from_code(&code).ok_or(RetentionError::UnknownSeriesType(code))?;

        if let Ok(mut kinds) = self.kinds.lock() {
            kinds.insert(storage.id, kind);
        }
        Ok(kind)
    }

    fn cached_kind(&self, storage_id: i32) -> Option<SeriesKind> {
        self.kinds.lock().ok()?.get(&storage_id).copied()
    }
}

/// Move the producing process's log rows into `storage_historics`.
/// Best effort: failures are logged and the run goes on.
async fn archive_historics(catalog: &dyn Catalog, storage: &StorageDefinition) {
    let producer = match catalog.producing_process(storage.data_series_id).await {
        Ok(Some(producer)) => producer,
        Ok(None) => {
            debug!(storage_id = storage.id, "No producing process to archive");
            return;
        }
        Err(e) => {
            warn!(storage_id = storage.id, error = %e, "Failed to look up producing process");
            return;
        }
    };

    match catalog.archive_history(storage.id, &producer).await {
        Ok(outcome) => info!(
            storage_id = storage.id,
            source = %producer.log_table(),
            archived = outcome.archived,
            logs_removed = outcome.logs_removed,
            "Archived producer history"
        ),
        Err(e) => warn!(
            storage_id = storage.id,
            source = %producer.log_table(),
            error = %e,
            "Failed to archive producer history"
        ),
    }
}

async fn write_log(
    catalog: &dyn Catalog,
    storage: &StorageDefinition,
    outcome: &RunOutcome,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Result<()> {
    let instance = storage.service_instance_id;
    catalog.ensure_log_tables(instance).await?;

    let entry = ProcessLogEntry {
        process_id: storage.id,
        status: outcome.status,
        start_timestamp: started_at,
        data_timestamp: outcome.data_timestamp,
        last_process_timestamp: finished_at,
    };
    let log_id = catalog.insert_log(instance, &entry).await?;

    if outcome.data_timestamp.is_none() {
        let description = if outcome.description.is_empty() {
            " ".to_string()
        } else {
            outcome.description.clone()
        };
        let message = LogMessage {
            log_id,
            status: outcome.status,
            description,
            timestamp: finished_at,
        };
        catalog.insert_log_message(instance, &message).await?;
    }
    Ok(())
}
