use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dataset::{DatasetConnector, DatasetStore, DeletedRow, DeletedRows, TableLayout};
use crate::error::{RetentionError, Result};

/// A row keyed by column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub timestamp: Option<DateTime<Utc>>,
    pub values: HashMap<String, Option<String>>,
}

impl StoredRow {
    pub fn new(timestamp: DateTime<Utc>, values: &[(&str, &str)]) -> Self {
        Self {
            timestamp: Some(timestamp),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), Some(v.to_string())))
                .collect(),
        }
    }
}

#[derive(Default)]
struct Tables {
    layouts: HashMap<String, TableLayout>,
    rows: HashMap<String, Vec<StoredRow>>,
    created: Vec<String>,
}

/// Dataset database kept in memory. Row timestamps stand in for the
/// timestamp column.
#[derive(Clone, Default)]
pub struct InMemoryDatasetStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap()
    }

    pub fn with_table(self, layout: TableLayout, rows: Vec<StoredRow>) -> Self {
        {
            let mut tables = self.tables();
            tables.rows.insert(layout.table.clone(), rows);
            tables.layouts.insert(layout.table.clone(), layout);
        }
        self
    }

    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.tables().rows.get(table).cloned().unwrap_or_default()
    }

    pub fn layout(&self, table: &str) -> Option<TableLayout> {
        self.tables().layouts.get(table).cloned()
    }

    /// Tables created through [`DatasetStore::ensure_table`].
    pub fn created_tables(&self) -> Vec<String> {
        self.tables().created.clone()
    }
}

#[async_trait]
impl DatasetStore for InMemoryDatasetStore {
    async fn describe(&self, table: &str) -> Result<TableLayout> {
        self.layout(table)
            .ok_or_else(|| RetentionError::EmptyTable(table.to_string()))
    }

    async fn delete_older_than(
        &self,
        table: &str,
        _timestamp_column: &str,
        cutoff: DateTime<Utc>,
        returning: &[String],
    ) -> Result<DeletedRows> {
        let mut tables = self.tables();
        let rows = tables
            .rows
            .get_mut(table)
            .ok_or_else(|| RetentionError::EmptyTable(table.to_string()))?;

        let (expired, kept): (Vec<StoredRow>, Vec<StoredRow>) = rows
            .drain(..)
            .partition(|row| row.timestamp.is_some_and(|ts| ts < cutoff));
        *rows = kept;

        Ok(DeletedRows {
            columns: returning.to_vec(),
            rows: expired
                .into_iter()
                .map(|row| DeletedRow {
                    timestamp: row.timestamp,
                    values: returning
                        .iter()
                        .map(|c| row.values.get(c).cloned().flatten())
                        .collect(),
                })
                .collect(),
        })
    }

    async fn ensure_table(&self, layout: &TableLayout) -> Result<()> {
        let mut tables = self.tables();
        if !tables.layouts.contains_key(&layout.table) {
            tables.layouts.insert(layout.table.clone(), layout.clone());
            tables.rows.insert(layout.table.clone(), Vec::new());
            tables.created.push(layout.table.clone());
        }
        Ok(())
    }

    async fn insert_rows(&self, layout: &TableLayout, rows: &DeletedRows) -> Result<u64> {
        let mut tables = self.tables();
        let target = tables
            .rows
            .get_mut(&layout.table)
            .ok_or_else(|| RetentionError::EmptyTable(layout.table.clone()))?;

        for row in &rows.rows {
            target.push(StoredRow {
                timestamp: row.timestamp,
                values: rows
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.values.iter().cloned())
                    .collect(),
            });
        }
        Ok(rows.rows.len() as u64)
    }
}

/// Hands out registered stores by provider uri.
#[derive(Clone, Default)]
pub struct InMemoryDatasetConnector {
    stores: Arc<Mutex<HashMap<String, InMemoryDatasetStore>>>,
}

impl InMemoryDatasetConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(self, uri: &str, store: InMemoryDatasetStore) -> Self {
        self.stores.lock().unwrap().insert(uri.to_string(), store);
        self
    }
}

#[async_trait]
impl DatasetConnector for InMemoryDatasetConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn DatasetStore>> {
        let stores = self.stores.lock().unwrap();
        match stores.get(uri) {
            Some(store) => Ok(Arc::new(store.clone())),
            None => Err(RetentionError::InvalidUri {
                uri: uri.to_string(),
                message: "no store registered".to_string(),
            }),
        }
    }
}
