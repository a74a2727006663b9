use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::model::{Project, ScheduleRule, StorageDefinition};
use common::testing::InMemoryCatalog;
use futures::future::BoxFuture;
use ntest::timeout;
use scheduler::{JobLauncher, JobOutcome, Registration, ScheduleRegistry, SchedulingError};
use serde_json::json;
use tokio::sync::mpsc;

struct RecordingLauncher {
    runs: mpsc::UnboundedSender<i32>,
    delay: Duration,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl JobLauncher for RecordingLauncher {
    fn launch(&self, storage: StorageDefinition) -> BoxFuture<'static, anyhow::Result<()>> {
        let runs = self.runs.clone();
        let delay = self.delay;
        let running = self.running.clone();
        let peak = self.peak.clone();
        Box::pin(async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            running.fetch_sub(1, Ordering::SeqCst);
            let _ = runs.send(storage.id);
            Ok(())
        })
    }
}

type Harness = (ScheduleRegistry, mpsc::UnboundedReceiver<i32>, Arc<AtomicUsize>);

fn registry(delay: Duration) -> Harness {
    let (runs, received) = mpsc::unbounded_channel();
    let peak = Arc::new(AtomicUsize::new(0));
    let launcher = RecordingLauncher {
        runs,
        delay,
        running: Arc::new(AtomicUsize::new(0)),
        peak: peak.clone(),
    };
    (
        ScheduleRegistry::new(Arc::new(launcher), chrono_tz::UTC),
        received,
        peak,
    )
}

fn storage(
    id: i32,
    schedule_id: Option<i32>,
    project_id: Option<i32>,
    active: bool,
) -> StorageDefinition {
    serde_json::from_value(json!({
        "id": id,
        "data_series_id": 1,
        "service_instance_id": 1,
        "schedule_id": schedule_id,
        "project_id": project_id,
        "active": active
    }))
    .unwrap()
}

fn every_second() -> ScheduleRule {
    ScheduleRule {
        id: 10,
        frequency: Some(1),
        frequency_unit: Some("seconds".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_skipped_storages_get_no_timer() {
    let catalog = InMemoryCatalog::new()
        .with_schedule(every_second())
        .with_project(3, false);
    let (registry, _runs, _) = registry(Duration::ZERO);
    let projects = vec![Project {
        id: 2,
        name: "fires".to_string(),
        active: false,
    }];

    let outcomes = registry
        .register_batch(
            vec![
                storage(1, Some(10), None, false),
                storage(2, Some(10), Some(2), true),
                storage(3, Some(10), Some(3), true),
                storage(4, Some(99), None, true),
            ],
            &projects,
            &catalog,
        )
        .await;

    assert!(matches!(outcomes[0].1, Err(SchedulingError::InactiveStorage(1))));
    assert!(matches!(outcomes[1].1, Err(SchedulingError::InactiveProject(2))));
    assert!(matches!(outcomes[2].1, Err(SchedulingError::InactiveProject(3))));
    assert!(matches!(outcomes[3].1, Err(SchedulingError::MissingSchedule(99))));
    assert_eq!(registry.timer_count(), 0);
    // definitions stay available for lookups
    assert_eq!(registry.len(), 4);
}

#[tokio::test]
async fn test_batch_project_overrides_catalog() {
    let catalog = InMemoryCatalog::new()
        .with_schedule(every_second())
        .with_project(5, false);
    let (registry, _runs, _) = registry(Duration::ZERO);
    let projects = vec![Project {
        id: 5,
        name: "now active".to_string(),
        active: true,
    }];

    let outcome = registry
        .register(storage(1, Some(10), Some(5), true), &projects, &catalog)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Registration::Scheduled {
            expression: "*/1 * * * * *".to_string()
        }
    );
    assert!(registry.has_timer(1));
}

#[tokio::test]
#[timeout(10000)]
async fn test_manual_storage_runs_only_when_triggered() {
    let catalog = InMemoryCatalog::new();
    let (registry, mut runs, _) = registry(Duration::ZERO);

    let mut manual = storage(8, Some(10), None, true);
    manual.schedule_type = Some(common::model::SCHEDULE_TYPE_MANUAL);
    let outcome = registry.register(manual, &[], &catalog).await.unwrap();

    assert_eq!(outcome, Registration::Manual);
    assert!(!registry.has_timer(8));

    let done = registry.trigger(8).unwrap();
    assert_eq!(done.await.unwrap(), JobOutcome::Completed);
    assert_eq!(runs.recv().await, Some(8));

    assert!(matches!(
        registry.trigger(404),
        Err(SchedulingError::UnknownStorage(404))
    ));
}

#[tokio::test]
#[timeout(10000)]
async fn test_timer_fires_registered_storage() {
    let catalog = InMemoryCatalog::new().with_schedule(every_second());
    let (registry, mut runs, _) = registry(Duration::ZERO);

    registry
        .register(storage(4, Some(10), None, true), &[], &catalog)
        .await
        .unwrap();

    assert_eq!(runs.recv().await, Some(4));
    assert_eq!(runs.recv().await, Some(4));
    registry.shutdown();
    assert_eq!(registry.timer_count(), 0);
}

#[tokio::test]
async fn test_sequential_reregistration_keeps_one_timer() {
    let catalog = InMemoryCatalog::new().with_schedule(every_second());
    let (registry, _runs, _) = registry(Duration::ZERO);

    for _ in 0..3 {
        registry
            .register(storage(6, Some(10), None, true), &[], &catalog)
            .await
            .unwrap();
    }
    assert_eq!(registry.timer_count(), 1);

    registry
        .register(storage(6, Some(10), None, false), &[], &catalog)
        .await
        .unwrap_err();
    assert_eq!(registry.timer_count(), 0);
    assert!(!registry.get(6).unwrap().active);
}

fn drain(runs: &mut mpsc::UnboundedReceiver<i32>) -> usize {
    let mut count = 0;
    while runs.try_recv().is_ok() {
        count += 1;
    }
    count
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn test_overlapping_registrations_keep_one_timer() {
    let catalog = InMemoryCatalog::new()
        .with_schedule(every_second())
        .with_schedule_latency(Duration::from_millis(300));
    let (registry, mut runs, _) = registry(Duration::ZERO);

    let (first, second) = tokio::join!(
        registry.register(storage(6, Some(10), None, true), &[], &catalog),
        registry.register(storage(6, Some(10), None, true), &[], &catalog),
    );

    assert!(matches!(first, Err(SchedulingError::Superseded(6))));
    assert!(matches!(second, Ok(Registration::Scheduled { .. })));
    assert_eq!(registry.timer_count(), 1);

    // one timer at 1/s fires at most four times in 3.5s
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let fired = drain(&mut runs);
    assert!((2..=4).contains(&fired), "fired {fired} times");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn test_deactivation_during_registration_stops_timer() {
    let catalog = InMemoryCatalog::new()
        .with_schedule(every_second())
        .with_schedule_latency(Duration::from_millis(300));
    let (registry, mut runs, _) = registry(Duration::ZERO);

    let (activated, deactivated) = tokio::join!(
        registry.register(storage(6, Some(10), None, true), &[], &catalog),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry
                .register(storage(6, Some(10), None, false), &[], &catalog)
                .await
        },
    );

    assert!(matches!(activated, Err(SchedulingError::Superseded(6))));
    assert!(matches!(deactivated, Err(SchedulingError::InactiveStorage(6))));
    assert_eq!(registry.timer_count(), 0);
    assert!(!registry.get(6).unwrap().active);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(drain(&mut runs), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn test_slow_runs_never_overlap() {
    let catalog = InMemoryCatalog::new().with_schedule(every_second());
    let (registry, mut runs, peak) = registry(Duration::from_millis(1500));

    registry
        .register(storage(2, Some(10), None, true), &[], &catalog)
        .await
        .unwrap();
    // a manual trigger competes with the timer for the same queue
    let manual = registry.trigger(2).unwrap();

    assert_eq!(runs.recv().await, Some(2));
    assert_eq!(runs.recv().await, Some(2));
    assert_eq!(manual.await.unwrap(), JobOutcome::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
