//! Retention over series stored in PostGIS tables.

use common::Catalog;
use common::model::{SeriesKind, StatusLog, StorageDefinition};
use common::sql::split_table;
use tracing::{debug, info};

use crate::cutoff::RetentionCutoff;
use crate::dataset::DatasetConnector;
use crate::error::{RetentionError, Result};
use crate::runner::RunOutcome;

/// Timestamp column of `dcp_data_<series>` tables.
pub const SINGLE_TABLE_TIMESTAMP: &str = "datetime";
/// Timestamp column of analysis result tables.
pub const ANALYSIS_TIMESTAMP: &str = "execution_date";

/// A table to prune and the database holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub table: String,
    pub timestamp_column: String,
    pub geometry_column: Option<String>,
    pub provider_uri: String,
}

/// Tables of a series and their timestamp columns.
pub async fn resolve_targets(
    storage: &StorageDefinition,
    kind: SeriesKind,
    catalog: &dyn Catalog,
) -> Result<Vec<TableTarget>> {
    let series = storage.data_series_id;
    let missing = |what: String| RetentionError::MissingMetadata(what);

    let targets = match kind {
        SeriesKind::SingleTable => {
            let provider_uri = catalog
                .series_provider_uri(series)
                .await?
                .ok_or_else(|| missing(format!("provider of data series {series}")))?;
            vec![TableTarget {
                table: format!("dcp_data_{series}"),
                timestamp_column: SINGLE_TABLE_TIMESTAMP.to_string(),
                geometry_column: None,
                provider_uri,
            }]
        }
        SeriesKind::MultiTable => {
            let mut targets = Vec::new();
            for table in catalog.series_tables(series).await? {
                let timestamp_column = catalog
                    .data_set_format(table.data_set_id, "timestamp_property")
                    .await?
                    .ok_or_else(|| {
                        missing(format!("timestamp_property of data set {}", table.data_set_id))
                    })?;
                let geometry_column = catalog
                    .data_set_format(table.data_set_id, "geometry_property")
                    .await?;
                targets.push(TableTarget {
                    table: table.table_name,
                    timestamp_column,
                    geometry_column,
                    provider_uri: table.provider_uri,
                });
            }
            targets
        }
        SeriesKind::AnalysisMonitoredObject => catalog
            .series_tables(series)
            .await?
            .into_iter()
            .map(|table| TableTarget {
                table: table.table_name,
                timestamp_column: ANALYSIS_TIMESTAMP.to_string(),
                geometry_column: None,
                provider_uri: table.provider_uri,
            })
            .collect(),
        SeriesKind::GridFiles => {
            return Err(RetentionError::UnknownSeriesType("GRID-geotiff".to_string()));
        }
    };

    if targets.is_empty() {
        return Err(missing(format!("tables of data series {series}")));
    }
    Ok(targets)
}

/// Backup table for `table`, suffixed with the source name when the series
/// spans several tables.
pub fn backup_table_name(
    storage: &StorageDefinition,
    table: &str,
    table_count: usize,
) -> Result<String> {
    let base = storage.backup_name();
    if base.is_empty() {
        return Err(RetentionError::MissingMetadata(format!(
            "backup table name of storage {}",
            storage.id
        )));
    }
    if table_count > 1 {
        let (_, bare) = split_table(table);
        Ok(format!("{base}_{bare}"))
    } else {
        Ok(base.to_string())
    }
}

/// Delete expired rows from every table of the series, copying them to a
/// backup table first when the storage asks for it.
pub async fn run_table_retention(
    storage: &StorageDefinition,
    kind: SeriesKind,
    catalog: &dyn Catalog,
    datasets: &dyn DatasetConnector,
    cutoff: &RetentionCutoff,
) -> Result<RunOutcome> {
    let targets = resolve_targets(storage, kind, catalog).await?;

    let mut removed = 0usize;
    let mut backed_up = 0u64;
    let mut backup_tables = Vec::new();
    let mut data_timestamp = None;

    for target in &targets {
        let store = datasets.connect(&target.provider_uri).await?;
        let layout = store.describe(&target.table).await?;
        let returning: Vec<String> = layout.backup_columns().map(|c| c.name.clone()).collect();

        debug!(
            storage_id = storage.id,
            table = %target.table,
            timestamp_column = %target.timestamp_column,
            geometry_column = ?target.geometry_column,
            cutoff = %cutoff.cutoff_timestamp,
            "Deleting expired rows"
        );

        let deleted = store
            .delete_older_than(
                &target.table,
                &target.timestamp_column,
                cutoff.cutoff_timestamp,
                &returning,
            )
            .await?;
        if deleted.is_empty() {
            continue;
        }

        removed += deleted.len();
        data_timestamp = data_timestamp.max(deleted.last_timestamp());

        if storage.backup {
            let provider_id = storage.data_provider_id.ok_or_else(|| {
                RetentionError::MissingMetadata(format!("backup provider of storage {}", storage.id))
            })?;
            let backup_uri = catalog.provider_uri(provider_id).await?.ok_or_else(|| {
                RetentionError::MissingMetadata(format!("data provider {provider_id}"))
            })?;

            let backup_table = backup_table_name(storage, &target.table, targets.len())?;
            let backup_layout = layout.renamed(&backup_table);
            let destination = datasets.connect(&backup_uri).await?;
            destination.ensure_table(&backup_layout).await?;
            backed_up += destination.insert_rows(&backup_layout, &deleted).await?;
            backup_tables.push(backup_table);
        }
    }

    if removed == 0 {
        return Ok(RunOutcome::no_data());
    }

    let tables: Vec<&str> = targets.iter().map(|t| t.table.as_str()).collect();
    let description = if storage.backup {
        format!(
            "moved rows: {removed} from {} to {} ({backed_up} inserted)",
            tables.join(", "),
            backup_tables.join(", ")
        )
    } else {
        format!("removed rows: {removed} from {}", tables.join(", "))
    };
    info!(storage_id = storage.id, "{description}");

    Ok(RunOutcome {
        status: StatusLog::Done,
        data_timestamp,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::catalog::SeriesTable;
    use common::testing::InMemoryCatalog;

    fn storage(uri: &str) -> StorageDefinition {
        serde_json::from_value(serde_json::json!({
            "id": 3, "data_series_id": 8, "service_instance_id": 1, "uri": uri
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_table_target() {
        let catalog = InMemoryCatalog::new().with_series_provider(8, "postgis://db/dcp");
        let targets = resolve_targets(&storage(""), SeriesKind::SingleTable, &catalog)
            .await
            .unwrap();

        assert_eq!(
            targets,
            vec![TableTarget {
                table: "dcp_data_8".to_string(),
                timestamp_column: "datetime".to_string(),
                geometry_column: None,
                provider_uri: "postgis://db/dcp".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_multi_table_requires_timestamp_property() {
        let catalog = InMemoryCatalog::new().with_series_table(
            8,
            SeriesTable {
                data_set_id: 21,
                table_name: "occurrences".to_string(),
                provider_uri: "postgis://db/x".to_string(),
            },
        );
        let result = resolve_targets(&storage(""), SeriesKind::MultiTable, &catalog).await;
        assert!(matches!(result, Err(RetentionError::MissingMetadata(_))));

        let catalog = catalog.with_format(21, "timestamp_property", "obs_time");
        let targets = resolve_targets(&storage(""), SeriesKind::MultiTable, &catalog)
            .await
            .unwrap();
        assert_eq!(targets[0].timestamp_column, "obs_time");
    }

    #[test]
    fn test_backup_table_name() {
        let storage = storage("backups/fires");
        assert_eq!(backup_table_name(&storage, "public.occ", 1).unwrap(), "fires");
        assert_eq!(backup_table_name(&storage, "public.occ", 2).unwrap(), "fires_occ");
    }
}
