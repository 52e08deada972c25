use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use procflow::logging::LoggingConfig;
use procflow::{
    action_noop, EngineConfig, EventRecorder, JoinKind, ProcessBuilder, ProcessDefinition,
    ProcessEnvironment, ProcessError, ProcessInstance, ProcessInstanceId, ProcessInstanceSnapshot,
    ProcessRegistry, ProcessSession, ProcessState, SplitKind, TransactionStatus,
    TransactionSynchronization,
};
use serde_json::{json, Value};

fn approval_process() -> anyhow::Result<ProcessDefinition> {
    let mut builder = ProcessBuilder::new("approval", "Dual approval");
    builder
        .add_start("Start")
        .add_split("Fork", SplitKind::And)
        .add_event_wait("Legal", "legal")
        .add_event_wait("Finance", "finance")
        .add_join("Sync", JoinKind::And)
        .add_action("Publish", action_noop())
        .add_end("End")
        .connect("Start", "Fork")
        .connect("Fork", "Legal")
        .connect("Fork", "Finance")
        .connect("Legal", "Sync")
        .connect("Finance", "Sync")
        .connect("Sync", "Publish")
        .connect("Publish", "End");
    builder.build().map_err(Into::into)
}

fn recorded_environment() -> (Arc<ProcessEnvironment>, Arc<EventRecorder>) {
    let recorder = EventRecorder::new();
    let environment = ProcessEnvironment::new()
        .with_listener(recorder.clone())
        .into_shared();
    (environment, recorder)
}

#[test]
fn resumed_instance_matches_uninterrupted_run() -> anyhow::Result<()> {
    let definition = Arc::new(approval_process()?);

    let (environment, straight_events) = recorded_environment();
    let mut straight = ProcessInstance::new(1, Arc::clone(&definition), environment, EngineConfig::queue_based());
    straight.start(BTreeMap::new())?;
    straight.signal_event("legal", Value::Null)?;
    straight.signal_event("finance", Value::Null)?;
    assert_eq!(straight.state(), ProcessState::Completed);

    let (environment, before_events) = recorded_environment();
    let mut first = ProcessInstance::new(1, Arc::clone(&definition), environment, EngineConfig::queue_based());
    first.start(BTreeMap::new())?;
    first.signal_event("legal", Value::Null)?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("approval-1.json");
    first.snapshot().write_to(&path)?;
    drop(first);

    let snapshot = ProcessInstanceSnapshot::read_from(&path)?;
    let (environment, after_events) = recorded_environment();
    let mut resumed = ProcessInstance::restore(snapshot, Arc::clone(&definition), environment)?;
    assert_eq!(resumed.state(), ProcessState::Active);
    assert_eq!(resumed.node_instances_by_name("Finance").len(), 1);
    assert_eq!(resumed.node_instances_by_name("Sync").len(), 1);

    resumed.signal_event("finance", Value::Null)?;

    assert_eq!(resumed.state(), ProcessState::Completed);
    let mut combined = before_events.triggered();
    combined.extend(after_events.triggered());
    assert_eq!(combined, straight_events.triggered());
    assert_eq!(resumed.completed_node_ids(), straight.completed_node_ids());
    Ok(())
}

#[test]
fn snapshot_keeps_variables_and_pending_work() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("review", "Review");
    builder
        .add_start("Start")
        .add_work_item("Review", "human")
        .map_work_item_output("Review", "verdict", "verdict")
        .add_end("End")
        .connect("Start", "Review")
        .connect("Review", "End");
    let definition = Arc::new(builder.build()?);

    let environment = ProcessEnvironment::new().into_shared();
    let mut instance = ProcessInstance::new(5, Arc::clone(&definition), Arc::clone(&environment), EngineConfig::recursive());
    instance.start(BTreeMap::from([("author".to_string(), json!("lin"))]))?;
    let item = instance.work_items().next().map(|item| item.id).expect("pending review");

    let json = instance.snapshot().to_json()?;
    let mut restored = ProcessInstance::restore(ProcessInstanceSnapshot::from_json(&json)?, definition, environment)?;

    assert_eq!(restored.id(), 5);
    assert_eq!(restored.get_variable("author"), Some(json!("lin")));
    restored.complete_work_item(item, BTreeMap::from([("verdict".to_string(), json!("ok"))]))?;
    assert_eq!(restored.state(), ProcessState::Completed);
    assert_eq!(restored.get_variable("verdict"), Some(json!("ok")));
    Ok(())
}

#[test]
fn corrupt_snapshot_is_a_context_error() {
    let err = ProcessInstanceSnapshot::from_json("{\"version\": 1").unwrap_err();
    assert!(matches!(err, ProcessError::Context(_)));
}

#[derive(Default)]
struct CommitLog {
    entries: Mutex<Vec<(ProcessInstanceId, TransactionStatus)>>,
}

impl TransactionSynchronization for CommitLog {
    fn after_completion(&self, id: ProcessInstanceId, status: TransactionStatus) {
        self.entries.lock().push((id, status));
    }
}

fn session() -> anyhow::Result<(Arc<ProcessSession>, Arc<CommitLog>)> {
    LoggingConfig::init_for_tests();
    let mut registry = ProcessRegistry::new();
    registry.register(approval_process()?);
    let session = Arc::new(ProcessSession::new(
        Arc::new(registry),
        ProcessEnvironment::new().into_shared(),
        EngineConfig::queue_based(),
    ));
    let log = Arc::new(CommitLog::default());
    session.register_synchronization(log.clone());
    Ok((session, log))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_runs_instances_concurrently() -> anyhow::Result<()> {
    let (session, log) = session()?;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let session = Arc::clone(&session);
        tasks.push(tokio::task::spawn_blocking(move || -> procflow::Result<ProcessInstanceId> {
            let id = session.start_process("approval", BTreeMap::new())?;
            session.signal_event(id, "finance", Value::Null)?;
            session.signal_event(id, "legal", Value::Null)?;
            Ok(id)
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await??);
    }
    ids.sort_unstable();

    assert_eq!(ids, (1..=16).collect::<Vec<_>>());
    assert_eq!(session.instance_ids(), ids);
    for id in &ids {
        assert_eq!(session.state(*id)?, ProcessState::Completed);
    }
    let entries = log.entries.lock();
    assert_eq!(entries.len(), 16 * 3);
    assert!(entries
        .iter()
        .all(|(_, status)| *status == TransactionStatus::Committed));
    Ok(())
}

#[tokio::test]
async fn session_snapshot_survives_removal() -> anyhow::Result<()> {
    let (session, _log) = session()?;
    let id = session.start_process("approval", BTreeMap::new())?;
    session.signal_event(id, "legal", Value::Null)?;

    let snapshot = session.snapshot(id)?;
    session.remove(id)?;
    assert!(matches!(session.state(id), Err(ProcessError::ProcessInstanceNotFound(_))));

    let restored = session.restore(snapshot)?;
    assert_eq!(restored, id);
    session.signal_event(id, "finance", Value::Null)?;
    assert_eq!(session.state(id)?, ProcessState::Completed);

    let next = session.start_process("approval", BTreeMap::new())?;
    assert!(next > id);
    Ok(())
}
