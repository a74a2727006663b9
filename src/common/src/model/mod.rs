//! Data shared between the controller payloads, the catalog and the
//! retention executors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

mod lenient;

pub use lenient::{lenient_bool, lenient_i32, lenient_i64, lenient_opt_i32, null_as_default};

/// Schedule type code the orchestrator uses for manually triggered storages.
pub const SCHEDULE_TYPE_MANUAL: i32 = 1;

/// A retention/archival policy bound to one data series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDefinition {
    #[serde(deserialize_with = "lenient_i32")]
    pub id: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "lenient_i32")]
    pub data_series_id: i32,
    /// Provider receiving backups (destination folder or database)
    #[serde(default, deserialize_with = "lenient_opt_i32")]
    pub data_provider_id: Option<i32>,
    #[serde(deserialize_with = "lenient_i32")]
    pub service_instance_id: i32,
    #[serde(default, deserialize_with = "lenient_opt_i32")]
    pub schedule_id: Option<i32>,
    #[serde(default, deserialize_with = "lenient_opt_i32")]
    pub schedule_type: Option<i32>,
    #[serde(default, deserialize_with = "lenient_opt_i32")]
    pub project_id: Option<i32>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub keep_data: i64,
    #[serde(default = "default_keep_data_unit", deserialize_with = "keep_data_unit")]
    pub keep_data_unit: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub backup: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub zip: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub filter: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub erase_all: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub active: bool,
    /// Destination path segment or backup table name
    #[serde(default, deserialize_with = "null_as_default")]
    pub uri: String,
}

fn default_keep_data_unit() -> String {
    "d".to_string()
}

fn keep_data_unit<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_keep_data_unit))
}

impl StorageDefinition {
    /// Amount of data to keep once `erase_all` has been applied.
    pub fn effective_keep_data(&self) -> i64 {
        if self.erase_all { 0 } else { self.keep_data }
    }

    pub fn is_manual(&self) -> bool {
        self.schedule_type == Some(SCHEDULE_TYPE_MANUAL) || self.schedule_id.is_none()
    }

    /// Last path segment of the storage uri, used to name backup tables.
    pub fn backup_name(&self) -> &str {
        match self.uri.rfind('/') {
            Some(idx) => &self.uri[idx + 1..],
            None => &self.uri,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(deserialize_with = "lenient_i32")]
    pub id: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub active: bool,
}

/// Body of an ADD_DATA message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageBatch {
    #[serde(rename = "Storages", default)]
    pub storages: Vec<StorageDefinition>,
    #[serde(rename = "Projects", default)]
    pub projects: Vec<Project>,
}

/// A row of the `schedules` catalog table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub id: i32,
    pub frequency: Option<i32>,
    pub frequency_unit: Option<String>,
    pub frequency_start_time: Option<String>,
    /// Weekly flag: day of week, 1 to 7
    pub schedule: Option<i32>,
    pub schedule_unit: Option<String>,
    pub schedule_time: Option<String>,
}

impl ScheduleRule {
    pub fn is_weekly(&self) -> bool {
        self.schedule.is_some()
    }

    pub fn start_time(&self) -> Option<&str> {
        self.frequency_start_time
            .as_deref()
            .or(self.schedule_time.as_deref())
    }
}

/// Credentials carried by UPDATE_SERVICE under `log_database`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDatabase {
    #[serde(rename = "PG_USER", default)]
    pub user: String,
    #[serde(rename = "PG_PASSWORD", default)]
    pub password: String,
    #[serde(rename = "PG_HOST", default)]
    pub host: String,
    #[serde(rename = "PG_PORT", deserialize_with = "port_from_any")]
    pub port: u16,
    #[serde(rename = "PG_DB_NAME", default)]
    pub database: String,
}

fn port_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = lenient_i32(deserializer)?;
    u16::try_from(value).map_err(serde::de::Error::custom)
}

/// Body of an UPDATE_SERVICE message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceUpdate {
    #[serde(default, deserialize_with = "lenient_opt_i32")]
    pub instance_id: Option<i32>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub log_database: Option<LogDatabase>,
}

/// Body of a LOG query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub begin: u32,
    #[serde(default)]
    pub end: u32,
    #[serde(default)]
    pub process_ids: Vec<i32>,
}

impl LogQuery {
    /// Row window of the query as `(offset, limit)`; reversed bounds are
    /// swapped.
    pub fn window(&self) -> (u32, u32) {
        let (begin, end) = if self.begin > self.end {
            (self.end, self.begin)
        } else {
            (self.begin, self.end)
        };
        (begin, end - begin + 1)
    }
}

/// Body of a START_PROCESS message: the storages to run now.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartProcess {
    #[serde(default)]
    pub ids: Vec<serde_json::Value>,
}

impl StartProcess {
    /// Storage ids given as numbers or numeric strings; anything else is
    /// dropped.
    pub fn storage_ids(&self) -> Vec<i32> {
        self.ids
            .iter()
            .filter_map(|id| match id {
                serde_json::Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .collect()
    }
}

/// A row of `storage_<instance>` as returned to LOG queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredLog {
    pub id: i32,
    pub process_id: i32,
    pub status: i32,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub data_timestamp: Option<DateTime<Utc>>,
    pub last_process_timestamp: Option<DateTime<Utc>>,
    pub data: Option<String>,
    pub messages: Vec<StoredLogMessage>,
}

/// A row of `storage_<instance>_messages` as returned to LOG queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredLogMessage {
    pub id: i32,
    pub log_id: i32,
    #[serde(rename = "type")]
    pub status: i32,
    pub description: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Status codes shared with the orchestrator's process log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusLog {
    Error = 1,
    Start = 2,
    Done = 3,
    OnQueue = 4,
    Interrupted = 5,
    NotExecuted = 6,
    Warning = 7,
}

impl StatusLog {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Semantic family of a data series, which decides the retention executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesKind {
    /// `GRID-geotiff`: files named by a date mask
    GridFiles,
    /// `DCP-single_table`: one `dcp_data_<series>` table
    SingleTable,
    /// PostGIS series whose tables are listed in the dataset formats
    MultiTable,
    /// `ANALYSIS_MONITORED_OBJECT-postgis`: tables keyed by `execution_date`
    AnalysisMonitoredObject,
}

impl SeriesKind {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "GRID-geotiff" => Some(Self::GridFiles),
            "DCP-single_table" => Some(Self::SingleTable),
            "DCP-postgis" | "OCCURRENCE-postgis" => Some(Self::MultiTable),
            "ANALYSIS_MONITORED_OBJECT-postgis" => Some(Self::AnalysisMonitoredObject),
            _ => None,
        }
    }
}

/// One run's row in `storage_<instance>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessLogEntry {
    pub process_id: i32,
    pub status: StatusLog,
    pub start_timestamp: DateTime<Utc>,
    pub data_timestamp: Option<DateTime<Utc>>,
    pub last_process_timestamp: DateTime<Utc>,
}

impl ProcessLogEntry {
    /// Payload of the `data` column, present only when the run produced a
    /// data timestamp.
    pub fn data_payload(&self) -> Option<String> {
        self.data_timestamp?;
        Some(
            serde_json::json!({
                "processing_end_time": [self.last_process_timestamp.to_rfc3339()],
                "processing_start_time": [self.start_timestamp.to_rfc3339()],
            })
            .to_string(),
        )
    }
}

/// A row of `storage_<instance>_messages`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub log_id: i32,
    pub status: StatusLog,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Collector or analysis that writes the data series a storage prunes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducingProcess {
    pub origin: ProcessOrigin,
    /// Row id in `collectors` or `analysis`, used as the log `process_id`
    pub process_id: i32,
    pub service_instance_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOrigin {
    Collector,
    Analysis,
}

impl ProducingProcess {
    /// Name of the producer's log table, e.g. `collector_3`.
    pub fn log_table(&self) -> String {
        match self.origin {
            ProcessOrigin::Collector => format!("collector_{}", self.service_instance_id),
            ProcessOrigin::Analysis => format!("analysis_{}", self.service_instance_id),
        }
    }

    /// Origin tag stored in `storage_historics`.
    pub fn origin_tag(&self) -> &'static str {
        match self.origin {
            ProcessOrigin::Collector => "collectors",
            ProcessOrigin::Analysis => "analysis",
        }
    }
}
