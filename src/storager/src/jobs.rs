//! Jobs run by the schedule registry: a retention run wrapped in the
//! controller notifications that announce and conclude it.

use std::sync::Arc;

use chrono::Utc;
use common::model::{StatusLog, StorageDefinition};
use futures::future::BoxFuture;
use protocol::Signal;
use retention::{RetentionRunner, RunReport};
use scheduler::JobLauncher;
use serde_json::{Value, json};

use crate::controller::ControllerLink;

pub struct RetentionLauncher {
    runner: Arc<RetentionRunner>,
    link: Arc<ControllerLink>,
}

impl RetentionLauncher {
    pub fn new(runner: Arc<RetentionRunner>, link: Arc<ControllerLink>) -> Self {
        Self { runner, link }
    }
}

impl JobLauncher for RetentionLauncher {
    fn launch(&self, storage: StorageDefinition) -> BoxFuture<'static, anyhow::Result<()>> {
        let runner = self.runner.clone();
        let link = self.link.clone();
        Box::pin(async move {
            link.send(Signal::Log, &started_log(&storage));
            link.send(
                Signal::StartProcess,
                &json!({
                    "process_id": storage.id,
                    "instance_id": storage.service_instance_id,
                }),
            );

            let report = runner.run(&storage).await;
            link.send(Signal::ProcessFinished, &finished(&storage, &report));
            Ok(())
        })
    }
}

/// LOG notification announcing a run in progress.
pub fn started_log(storage: &StorageDefinition) -> Value {
    let now = Utc::now().to_rfc3339();
    json!([{
        "instance_id": storage.service_instance_id,
        "log": {
            "data": "",
            "data_timestamp": "",
            "last_process_timestamp": now,
            "messages": [],
            "process_id": storage.id,
            "start_timestamp": now,
            "status": StatusLog::Start.code(),
        },
        "process_id": storage.id,
    }])
}

/// PROCESS_FINISHED envelope for a completed run.
pub fn finished(storage: &StorageDefinition, report: &RunReport) -> Value {
    json!({
        "automatic": true,
        "execution_date": report.finished_at.to_rfc3339(),
        "instance_id": storage.service_instance_id,
        "result": report.result,
        "process_id": storage.id,
        "storage": storage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Outbound;
    use common::CatalogHandle;
    use common::testing::InMemoryCatalog;
    use protocol::decode;
    use retention::testing::InMemoryDatasetConnector;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_run_is_wrapped_in_notifications() {
        let source = tempfile::tempdir().unwrap();
        let catalog = InMemoryCatalog::new()
            .with_semantics(1, "GRID-geotiff")
            .with_grid_source(
                1,
                &format!("file://{}", source.path().display()),
                "%YYYY%MM%DD.tif",
            );
        let runner = RetentionRunner::new(
            Arc::new(CatalogHandle::new(Some(Arc::new(catalog)))),
            Arc::new(InMemoryDatasetConnector::new()),
        );
        let link = Arc::new(ControllerLink::new());
        let (sender, mut frames) = mpsc::unbounded_channel();
        link.attach(sender);

        let storage: StorageDefinition = serde_json::from_value(json!({
            "id": 5, "data_series_id": 1, "service_instance_id": 2, "keep_data": 1
        }))
        .unwrap();
        RetentionLauncher::new(Arc::new(runner), link)
            .launch(storage)
            .await
            .unwrap();

        let mut messages = Vec::new();
        while let Ok(Outbound::Frame(bytes)) = frames.try_recv() {
            messages.push(decode(&bytes));
        }
        let signals: Vec<Signal> = messages.iter().map(|m| m.signal).collect();
        assert_eq!(
            signals,
            vec![Signal::Log, Signal::StartProcess, Signal::ProcessFinished]
        );

        assert_eq!(messages[0].payload[0]["log"]["status"], json!(2));
        assert_eq!(messages[1].payload, json!({ "process_id": 5, "instance_id": 2 }));
        let finished = &messages[2].payload;
        assert_eq!(finished["result"], json!(true));
        assert_eq!(finished["automatic"], json!(true));
        assert_eq!(finished["storage"]["id"], json!(5));
    }
}
