//! Signal dispatch for controller messages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::config::DatabaseConfig;
use common::model::{LogDatabase, LogQuery, ServiceUpdate, StartProcess, StorageBatch};
use common::{CatalogConnector, CatalogHandle};
use protocol::{Message, Signal};
use scheduler::ScheduleRegistry;
use serde_json::{Value, json};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

/// Identity and lifecycle of this service instance, shared by every
/// connection.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub loaded: bool,
    pub instance_id: Option<i32>,
    pub instance_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub log_database: Option<LogDatabase>,
    pub shutting_down: bool,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            loaded: false,
            instance_id: None,
            instance_name: None,
            start_time: Utc::now(),
            log_database: None,
            shutting_down: false,
        }
    }
}

/// What a connection does after a message has been handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Reply(Message),
    /// Stop the service once earlier replies are written
    Shutdown,
}

pub struct Router {
    state: RwLock<ServiceState>,
    registry: Arc<ScheduleRegistry>,
    catalog: Arc<CatalogHandle>,
    connector: Arc<dyn CatalogConnector>,
    database: DatabaseConfig,
    version: String,
    shutdown: Arc<Notify>,
}

impl Router {
    pub fn new(
        registry: Arc<ScheduleRegistry>,
        catalog: Arc<CatalogHandle>,
        connector: Arc<dyn CatalogConnector>,
        database: DatabaseConfig,
        version: String,
    ) -> Self {
        Self {
            state: RwLock::new(ServiceState::default()),
            registry,
            catalog,
            connector,
            database,
            version,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn state(&self) -> ServiceState {
        self.state.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<ScheduleRegistry> {
        &self.registry
    }

    pub async fn handle(&self, message: &Message) -> Vec<Action> {
        debug!(signal = %message.signal, size = message.size, "Received message");
        match message.signal {
            Signal::Terminate => self.terminate().await,
            Signal::Status => vec![Action::Reply(self.status().await)],
            Signal::AddData => self.add_data(&message.payload).await,
            Signal::StartProcess => {
                self.start_process(&message.payload);
                Vec::new()
            }
            Signal::Log => self.logs(&message.payload).await,
            Signal::RemoveData => {
                info!(payload = %message.payload, "REMOVE_DATA received, nothing to do");
                Vec::new()
            }
            Signal::ProcessFinished => {
                info!("PROCESS_FINISHED received, nothing to do");
                Vec::new()
            }
            Signal::UpdateService => self.update_service(&message.payload).await,
            Signal::ValidateProcess => vec![Action::Reply(Message::new(
                Signal::ValidateProcess,
                json!({}),
            ))],
        }
    }

    async fn terminate(&self) -> Vec<Action> {
        info!("TERMINATE received, shutting down");
        self.state.write().await.shutting_down = true;
        vec![
            Action::Reply(Message::new(Signal::Terminate, Value::Null)),
            Action::Shutdown,
        ]
    }

    async fn status(&self) -> Message {
        let state = self.state.read().await.clone();
        if !state.loaded {
            return Message::new(Signal::Status, json!({ "service_loaded": false }));
        }
        Message::new(
            Signal::Status,
            json!({
                "instance_id": state.instance_id,
                "instance_name": state.instance_name,
                "logger_online": self.catalog.is_connected().await,
                "service_loaded": true,
                "shutting_down": state.shutting_down,
                "start_time": state.start_time.to_rfc3339(),
                "terrama2_version": self.version,
            }),
        )
    }

    async fn add_data(&self, payload: &Value) -> Vec<Action> {
        if payload.get("Storages").is_none() {
            debug!("ADD_DATA without storages ignored");
            return Vec::new();
        }
        let batch: StorageBatch = match serde_json::from_value(payload.clone()) {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Malformed ADD_DATA payload");
                return Vec::new();
            }
        };
        let catalog = match self.catalog.current().await {
            Ok(catalog) => catalog,
            Err(e) => {
                error!(error = %e, "Cannot register storages");
                return Vec::new();
            }
        };

        let outcomes = self
            .registry
            .register_batch(batch.storages, &batch.projects, catalog.as_ref())
            .await;
        let scheduled = outcomes.iter().filter(|(_, o)| o.is_ok()).count();
        info!(
            received = outcomes.len(),
            registered = scheduled,
            "Storages registered"
        );

        vec![Action::Reply(Message::new(
            Signal::ValidateProcess,
            json!({}),
        ))]
    }

    /// Queue an immediate run of each requested storage. Runs report back
    /// through the usual job notifications.
    fn start_process(&self, payload: &Value) {
        let request: StartProcess = match serde_json::from_value(payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Malformed START_PROCESS payload");
                return;
            }
        };
        for storage_id in request.storage_ids() {
            match self.registry.trigger(storage_id) {
                Ok(_) => info!(storage_id, "Manual run queued"),
                Err(e) => warn!(storage_id, reason = %e, "Manual run not started"),
            }
        }
    }

    async fn logs(&self, payload: &Value) -> Vec<Action> {
        let query: LogQuery = match serde_json::from_value(payload.clone()) {
            Ok(query) => query,
            Err(e) => {
                warn!(error = %e, "Malformed LOG query");
                return Vec::new();
            }
        };
        let Some(instance_id) = self.state.read().await.instance_id else {
            warn!("LOG query before UPDATE_SERVICE, no instance to read from");
            return Vec::new();
        };
        let (offset, limit) = query.window();
        debug!(offset, limit, process_ids = ?query.process_ids, "LOG query received");

        let catalog = match self.catalog.current().await {
            Ok(catalog) => Some(catalog),
            Err(e) => {
                error!(error = %e, "Cannot read process logs");
                None
            }
        };

        let mut entries = Vec::with_capacity(query.process_ids.len());
        for process_id in query.process_ids {
            let logs = match &catalog {
                Some(catalog) => catalog
                    .process_logs(instance_id, process_id, offset, limit)
                    .await
                    .unwrap_or_else(|e| {
                        error!(process_id, error = %e, "Failed to read process logs");
                        Vec::new()
                    }),
                None => Vec::new(),
            };
            entries.push(json!({
                "instance_id": instance_id,
                "process_id": process_id,
                "log": logs,
            }));
        }

        vec![Action::Reply(Message::new(Signal::Log, Value::Array(entries)))]
    }

    async fn update_service(&self, payload: &Value) -> Vec<Action> {
        let update: ServiceUpdate = match serde_json::from_value(payload.clone()) {
            Ok(update) => update,
            Err(e) => {
                error!(error = %e, "Malformed UPDATE_SERVICE payload");
                return Vec::new();
            }
        };

        let Some(instance_id) = update.instance_id else {
            return vec![Action::Reply(Message::new(
                Signal::UpdateService,
                payload.clone(),
            ))];
        };

        let reconnect = {
            let mut state = self.state.write().await;
            state.loaded = true;
            state.instance_id = Some(instance_id);
            state.instance_name = update.instance_name.clone();
            match update.log_database {
                Some(credentials) if state.log_database.as_ref() != Some(&credentials) => {
                    state.log_database = Some(credentials.clone());
                    Some(credentials)
                }
                _ => None,
            }
        };
        info!(
            instance_id,
            instance_name = ?update.instance_name,
            "Service instance updated"
        );

        if let Some(credentials) = reconnect {
            let config = with_credentials(&self.database, &credentials);
            match self.connector.connect(&config).await {
                Ok(catalog) => {
                    self.catalog.replace(catalog).await;
                    info!(host = %config.host, database = %config.name, "Catalog reconnected");
                }
                Err(e) => error!(error = %e, "Failed to connect with updated credentials"),
            }
        }
        Vec::new()
    }
}

fn with_credentials(base: &DatabaseConfig, credentials: &LogDatabase) -> DatabaseConfig {
    DatabaseConfig {
        host: credentials.host.clone(),
        port: credentials.port,
        user: credentials.user.clone(),
        password: credentials.password.clone(),
        name: credentials.database.clone(),
        ..base.clone()
    }
}
