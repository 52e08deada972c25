use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use procflow::runtime::WorkItemState;
use procflow::{
    AutoCompleteHandler, EngineConfig, ProcessBuilder, ProcessDefinition, ProcessEnvironment,
    ProcessError, ProcessInstance, ProcessState, WorkItem, WorkItemHandler, WorkItemOutcome,
};
use serde_json::{json, Value};

/// 记录派发与取消的挂起型处理器
#[derive(Default)]
struct InboxHandler {
    received: Mutex<Vec<u64>>,
    aborted: Mutex<Vec<u64>>,
}

impl WorkItemHandler for InboxHandler {
    fn execute(&self, item: &WorkItem) -> anyhow::Result<WorkItemOutcome> {
        self.received.lock().push(item.id);
        Ok(WorkItemOutcome::Pending)
    }

    fn abort(&self, item: &WorkItem) {
        self.aborted.lock().push(item.id);
    }
}

fn payment_process() -> anyhow::Result<Arc<ProcessDefinition>> {
    let mut builder = ProcessBuilder::new("payment", "Payment");
    builder
        .declare_variable("receipt", None)
        .add_start("Start")
        .add_work_item("Charge", "payment")
        .set_work_item_parameter("Charge", "currency", json!("EUR"))
        .map_work_item_input("Charge", "customer", "customer")
        .map_work_item_output("Charge", "receipt", "receipt")
        .add_end("End")
        .connect("Start", "Charge")
        .connect("Charge", "End");
    Ok(Arc::new(builder.build()?))
}

fn customer() -> BTreeMap<String, Value> {
    BTreeMap::from([("customer".to_string(), json!("ada"))])
}

#[test]
fn pending_work_item_completes_with_output_mapping() -> anyhow::Result<()> {
    let inbox = Arc::new(InboxHandler::default());
    let environment = ProcessEnvironment::new()
        .with_work_item_handler("payment", inbox.clone())
        .into_shared();
    let mut process = ProcessInstance::new(3, payment_process()?, environment, EngineConfig::queue_based());

    process.start(customer())?;

    let item = process.work_items().next().cloned().expect("pending work item");
    assert_eq!(item.state, WorkItemState::Pending);
    assert_eq!(item.process_instance, 3);
    assert_eq!(item.parameter("customer"), Some(&json!("ada")));
    assert_eq!(item.parameter("currency"), Some(&json!("EUR")));
    assert_eq!(*inbox.received.lock(), vec![item.id]);

    process.complete_work_item(item.id, BTreeMap::from([("receipt".to_string(), json!("r-17"))]))?;

    assert_eq!(process.state(), ProcessState::Completed);
    assert_eq!(process.get_variable("receipt"), Some(json!("r-17")));
    assert!(inbox.aborted.lock().is_empty());

    let err = process.complete_work_item(item.id, BTreeMap::new()).unwrap_err();
    assert!(matches!(err, ProcessError::InvalidState { .. }));
    Ok(())
}

#[test]
fn unknown_work_item_is_rejected() -> anyhow::Result<()> {
    let environment = ProcessEnvironment::new().into_shared();
    let mut process = ProcessInstance::new(1, payment_process()?, environment, EngineConfig::recursive());
    process.start(customer())?;

    // 没有处理器时工作项保持挂起
    assert_eq!(process.work_items().count(), 1);
    let err = process.complete_work_item(999, BTreeMap::new()).unwrap_err();
    assert!(matches!(err, ProcessError::UnknownWorkItem(999)));
    assert_eq!(process.state(), ProcessState::Active);
    Ok(())
}

#[test]
fn auto_complete_handler_finishes_synchronously() -> anyhow::Result<()> {
    for config in [EngineConfig::recursive(), EngineConfig::queue_based()] {
        let handler = AutoCompleteHandler::new().with_result("receipt", json!("auto"));
        let environment = ProcessEnvironment::new()
            .with_work_item_handler("payment", Arc::new(handler))
            .into_shared();
        let mut process = ProcessInstance::new(1, payment_process()?, environment, config);

        process.start(customer())?;

        assert_eq!(process.state(), ProcessState::Completed);
        assert_eq!(process.work_items().count(), 0);
        assert_eq!(process.get_variable("receipt"), Some(json!("auto")));
    }
    Ok(())
}

#[test]
fn interrupting_boundary_aborts_work_item() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("payment.timeout", "Payment with timeout");
    builder
        .add_start("Start")
        .add_work_item("Charge", "payment")
        .add_boundary_event("Timeout", "Charge", "timeout", true)
        .add_end("End")
        .add_end("TimedOut")
        .connect("Start", "Charge")
        .connect("Charge", "End")
        .connect("Timeout", "TimedOut");
    let definition = Arc::new(builder.build()?);

    let inbox = Arc::new(InboxHandler::default());
    let environment = ProcessEnvironment::new()
        .with_work_item_handler("payment", inbox.clone())
        .into_shared();
    let mut process = ProcessInstance::new(1, definition, environment, EngineConfig::queue_based());
    process.start(BTreeMap::new())?;
    let item = process.work_items().next().map(|item| item.id).expect("pending work item");

    process.signal_event("timeout", Value::Null)?;

    assert_eq!(*inbox.aborted.lock(), vec![item]);
    assert_eq!(process.work_items().count(), 0);
    assert_eq!(process.state(), ProcessState::Completed);
    Ok(())
}

#[test]
fn non_interrupting_boundary_keeps_work_item() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("payment.reminder", "Payment with reminder");
    builder
        .add_start("Start")
        .add_work_item("Charge", "payment")
        .add_boundary_event("Remind", "Charge", "reminder", false)
        .add_end("End")
        .add_end("Reminded")
        .connect("Start", "Charge")
        .connect("Charge", "End")
        .connect("Remind", "Reminded");
    let definition = Arc::new(builder.build()?);

    let inbox = Arc::new(InboxHandler::default());
    let environment = ProcessEnvironment::new()
        .with_work_item_handler("payment", inbox.clone())
        .into_shared();
    let mut process = ProcessInstance::new(1, definition, environment, EngineConfig::recursive());
    process.start(BTreeMap::new())?;

    process.signal_event("reminder", Value::Null)?;
    process.signal_event("reminder", Value::Null)?;

    assert!(inbox.aborted.lock().is_empty());
    assert_eq!(process.state(), ProcessState::Active);
    let item = process.work_items().next().map(|item| item.id).expect("work item still pending");

    process.abort_work_item(item)?;
    assert_eq!(process.state(), ProcessState::Completed);
    Ok(())
}
