use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::catalog::{
    Catalog, CatalogConnector, GridSource, HistoricsOutcome, Result, SeriesTable,
};
use crate::config::DatabaseConfig;
use crate::model::{
    LogMessage, ProcessLogEntry, ProducingProcess, ScheduleRule, StoredLog, StoredLogMessage,
};

/// A log row written through [`Catalog::insert_log`], with its messages.
#[derive(Debug, Clone)]
pub struct RecordedLog {
    pub service_instance_id: i32,
    pub id: i32,
    pub entry: ProcessLogEntry,
    pub messages: Vec<LogMessage>,
}

#[derive(Default)]
struct State {
    semantics: HashMap<i32, String>,
    projects: HashMap<i32, bool>,
    schedules: HashMap<i32, ScheduleRule>,
    providers: HashMap<i32, String>,
    series_providers: HashMap<i32, String>,
    grid_sources: HashMap<i32, GridSource>,
    series_tables: HashMap<i32, Vec<SeriesTable>>,
    formats: HashMap<(i32, String), String>,
    producers: HashMap<i32, ProducingProcess>,
    /// producer process id -> (log rows, message rows)
    producer_logs: HashMap<i32, (u64, u64)>,
    log_tables: HashSet<i32>,
    logs: Vec<RecordedLog>,
    historics: Vec<(i32, ProducingProcess, HistoricsOutcome)>,
    semantics_lookups: usize,
    schedule_latency: Duration,
}

/// Catalog kept in memory, seeded through builder methods.
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    state: Arc<Mutex<State>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_semantics(self, data_series_id: i32, code: &str) -> Self {
        self.state().semantics.insert(data_series_id, code.to_string());
        self
    }

    pub fn with_project(self, project_id: i32, active: bool) -> Self {
        self.state().projects.insert(project_id, active);
        self
    }

    pub fn with_schedule(self, rule: ScheduleRule) -> Self {
        self.state().schedules.insert(rule.id, rule);
        self
    }

    /// Delay every schedule lookup, to widen registration races.
    pub fn with_schedule_latency(self, latency: Duration) -> Self {
        self.state().schedule_latency = latency;
        self
    }

    pub fn with_provider(self, data_provider_id: i32, uri: &str) -> Self {
        self.state().providers.insert(data_provider_id, uri.to_string());
        self
    }

    pub fn with_series_provider(self, data_series_id: i32, uri: &str) -> Self {
        self.state()
            .series_providers
            .insert(data_series_id, uri.to_string());
        self
    }

    pub fn with_grid_source(self, data_series_id: i32, provider_uri: &str, mask: &str) -> Self {
        self.state().grid_sources.insert(
            data_series_id,
            GridSource {
                provider_uri: provider_uri.to_string(),
                mask: mask.to_string(),
            },
        );
        self
    }

    pub fn with_series_table(self, data_series_id: i32, table: SeriesTable) -> Self {
        self.state()
            .series_tables
            .entry(data_series_id)
            .or_default()
            .push(table);
        self
    }

    pub fn with_format(self, data_set_id: i32, key: &str, value: &str) -> Self {
        self.state()
            .formats
            .insert((data_set_id, key.to_string()), value.to_string());
        self
    }

    pub fn with_producer(self, data_series_id: i32, producer: ProducingProcess) -> Self {
        self.state().producers.insert(data_series_id, producer);
        self
    }

    /// Seed log and message rows for a producer process.
    pub fn with_producer_logs(self, process_id: i32, logs: u64, messages: u64) -> Self {
        self.state().producer_logs.insert(process_id, (logs, messages));
        self
    }

    pub fn logs(&self) -> Vec<RecordedLog> {
        self.state().logs.clone()
    }

    pub fn historics(&self) -> Vec<(i32, ProducingProcess, HistoricsOutcome)> {
        self.state().historics.clone()
    }

    pub fn has_log_tables(&self, service_instance_id: i32) -> bool {
        self.state().log_tables.contains(&service_instance_id)
    }

    pub fn producer_logs(&self, process_id: i32) -> Option<(u64, u64)> {
        self.state().producer_logs.get(&process_id).copied()
    }

    pub fn semantics_lookups(&self) -> usize {
        self.state().semantics_lookups
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn semantics_code(&self, data_series_id: i32) -> Result<Option<String>> {
        let mut state = self.state();
        state.semantics_lookups += 1;
        Ok(state.semantics.get(&data_series_id).cloned())
    }

    async fn project_active(&self, project_id: i32) -> Result<Option<bool>> {
        Ok(self.state().projects.get(&project_id).copied())
    }

    async fn schedule(&self, schedule_id: i32) -> Result<Option<ScheduleRule>> {
        let (rule, latency) = {
            let state = self.state();
            (state.schedules.get(&schedule_id).cloned(), state.schedule_latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(rule)
    }

    async fn provider_uri(&self, data_provider_id: i32) -> Result<Option<String>> {
        Ok(self.state().providers.get(&data_provider_id).cloned())
    }

    async fn series_provider_uri(&self, data_series_id: i32) -> Result<Option<String>> {
        Ok(self.state().series_providers.get(&data_series_id).cloned())
    }

    async fn grid_source(&self, data_series_id: i32) -> Result<Option<GridSource>> {
        Ok(self.state().grid_sources.get(&data_series_id).cloned())
    }

    async fn series_tables(&self, data_series_id: i32) -> Result<Vec<SeriesTable>> {
        Ok(self
            .state()
            .series_tables
            .get(&data_series_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn data_set_format(&self, data_set_id: i32, key: &str) -> Result<Option<String>> {
        Ok(self
            .state()
            .formats
            .get(&(data_set_id, key.to_string()))
            .cloned())
    }

    async fn producing_process(&self, data_series_id: i32) -> Result<Option<ProducingProcess>> {
        Ok(self.state().producers.get(&data_series_id).cloned())
    }

    async fn ensure_log_tables(&self, service_instance_id: i32) -> Result<()> {
        self.state().log_tables.insert(service_instance_id);
        Ok(())
    }

    async fn insert_log(&self, service_instance_id: i32, entry: &ProcessLogEntry) -> Result<i32> {
        let mut state = self.state();
        let id = state.logs.len() as i32 + 1;
        state.logs.push(RecordedLog {
            service_instance_id,
            id,
            entry: entry.clone(),
            messages: Vec::new(),
        });
        Ok(id)
    }

    async fn insert_log_message(
        &self,
        _service_instance_id: i32,
        message: &LogMessage,
    ) -> Result<()> {
        let mut state = self.state();
        if let Some(log) = state.logs.iter_mut().find(|l| l.id == message.log_id) {
            log.messages.push(message.clone());
        }
        Ok(())
    }

    async fn archive_history(
        &self,
        storage_id: i32,
        producer: &ProducingProcess,
    ) -> Result<HistoricsOutcome> {
        let mut state = self.state();
        let (logs, messages) = state
            .producer_logs
            .remove(&producer.process_id)
            .unwrap_or_default();
        let outcome = HistoricsOutcome {
            archived: if messages > 0 { messages } else { logs },
            messages_removed: messages,
            logs_removed: logs,
        };
        state.historics.push((storage_id, producer.clone(), outcome));
        Ok(outcome)
    }

    async fn process_logs(
        &self,
        service_instance_id: i32,
        process_id: i32,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<StoredLog>> {
        let state = self.state();
        let mut logs: Vec<&RecordedLog> = state
            .logs
            .iter()
            .filter(|l| l.service_instance_id == service_instance_id)
            .filter(|l| l.entry.process_id == process_id)
            .collect();
        logs.sort_by(|a, b| b.id.cmp(&a.id));

        Ok(logs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|log| StoredLog {
                id: log.id,
                process_id: log.entry.process_id,
                status: log.entry.status.code(),
                start_timestamp: Some(log.entry.start_timestamp),
                data_timestamp: log.entry.data_timestamp,
                last_process_timestamp: Some(log.entry.last_process_timestamp),
                data: log.entry.data_payload(),
                messages: log
                    .messages
                    .iter()
                    .enumerate()
                    .map(|(idx, message)| StoredLogMessage {
                        id: idx as i32 + 1,
                        log_id: log.id,
                        status: message.status.code(),
                        description: Some(message.description.clone()),
                        timestamp: Some(message.timestamp),
                    })
                    .collect(),
            })
            .collect())
    }
}

/// Hands out clones of one in-memory catalog and records the requested
/// credentials.
#[derive(Clone, Default)]
pub struct InMemoryCatalogConnector {
    pub catalog: InMemoryCatalog,
    requests: Arc<Mutex<Vec<DatabaseConfig>>>,
}

impl InMemoryCatalogConnector {
    pub fn new(catalog: InMemoryCatalog) -> Self {
        Self {
            catalog,
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<DatabaseConfig> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogConnector for InMemoryCatalogConnector {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn Catalog>> {
        self.requests.lock().unwrap().push(config.clone());
        Ok(Arc::new(self.catalog.clone()))
    }
}
