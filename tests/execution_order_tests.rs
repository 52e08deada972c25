use std::collections::BTreeMap;
use std::sync::Arc;

use procflow::flow::Constraint;
use procflow::{
    action_noop, condition_from_fn, ContainerKey, EngineConfig, EventPhase, EventRecorder, JoinKind,
    NodeContext, NodeHandler, NodeOutcome, ProcessBuilder, ProcessDefinition, ProcessEnvironment,
    ProcessError, ProcessInstance, ProcessState, SplitKind,
};
use serde_json::{json, Value};

struct WaitHandler;

impl NodeHandler for WaitHandler {
    fn enter(&self, _ctx: &mut NodeContext<'_>) -> anyhow::Result<NodeOutcome> {
        Ok(NodeOutcome::Wait)
    }
}

fn strategies() -> [EngineConfig; 2] {
    [EngineConfig::recursive(), EngineConfig::queue_based()]
}

fn launch(
    definition: &Arc<ProcessDefinition>,
    config: EngineConfig,
    params: BTreeMap<String, Value>,
) -> anyhow::Result<(ProcessInstance, Arc<EventRecorder>)> {
    let recorder = EventRecorder::new();
    let environment = ProcessEnvironment::new()
        .with_listener(recorder.clone())
        .with_node_handler("wait", Arc::new(WaitHandler))
        .into_shared();
    let mut instance = ProcessInstance::new(1, Arc::clone(definition), environment, config);
    instance.start(params)?;
    Ok((instance, recorder))
}

fn fork_join_process() -> anyhow::Result<Arc<ProcessDefinition>> {
    let mut builder = ProcessBuilder::new("order.fork", "Fork and join");
    builder
        .add_start("Start")
        .add_split("Fork", SplitKind::And)
        .add_action("A", action_noop())
        .add_action("B", action_noop())
        .add_action("C", action_noop())
        .add_join("Sync", JoinKind::And)
        .add_end("End")
        .connect("Start", "Fork")
        .connect("Fork", "A")
        .connect("A", "B")
        .connect("B", "Sync")
        .connect("Fork", "C")
        .connect("C", "Sync")
        .connect("Sync", "End");
    Ok(Arc::new(builder.build()?))
}

fn nested_process() -> anyhow::Result<Arc<ProcessDefinition>> {
    let mut builder = ProcessBuilder::new("order.nested", "Nested");
    builder
        .add_start("Start")
        .add_sub_process("Sub", |sub| {
            sub.add_start("SubStart")
                .add_split("SubFork", SplitKind::And)
                .add_action("X", action_noop())
                .add_action("Y", action_noop())
                .add_end("SubEndX")
                .add_end("SubEndY")
                .connect("SubStart", "SubFork")
                .connect("SubFork", "X")
                .connect("SubFork", "Y")
                .connect("X", "SubEndX")
                .connect("Y", "SubEndY");
        })
        .add_action("After", action_noop())
        .add_end("End")
        .connect("Start", "Sub")
        .connect("Sub", "After")
        .connect("After", "End");
    Ok(Arc::new(builder.build()?))
}

#[test]
fn fork_join_order_is_depth_first_for_both_strategies() -> anyhow::Result<()> {
    let definition = fork_join_process()?;
    for config in strategies() {
        let (instance, recorder) = launch(&definition, config.clone(), BTreeMap::new())?;
        assert_eq!(instance.state(), ProcessState::Completed, "{:?}", config.strategy);
        assert_eq!(
            recorder.triggered(),
            vec!["Start", "Fork", "A", "B", "Sync", "C", "Sync", "End"],
            "{:?}",
            config.strategy
        );
        assert_eq!(instance.pending_actions(), 0);
    }
    Ok(())
}

#[test]
fn sub_process_order_matches_between_strategies() -> anyhow::Result<()> {
    let definition = nested_process()?;
    let (recursive, recursive_events) = launch(&definition, EngineConfig::recursive(), BTreeMap::new())?;
    let (queued, queued_events) = launch(&definition, EngineConfig::queue_based(), BTreeMap::new())?;

    assert_eq!(recursive.state(), ProcessState::Completed);
    assert_eq!(queued.state(), ProcessState::Completed);
    assert_eq!(
        recursive_events.triggered(),
        vec!["Start", "Sub", "SubStart", "SubFork", "X", "SubEndX", "Y", "SubEndY", "After", "End"]
    );
    assert_eq!(recursive_events.triggered(), queued_events.triggered());
    assert_eq!(recursive.completed_node_ids(), queued.completed_node_ids());
    Ok(())
}

#[test]
fn nested_node_instances_report_colon_joined_unique_ids() -> anyhow::Result<()> {
    let definition = nested_process()?;
    let (_, recorder) = launch(&definition, EngineConfig::recursive(), BTreeMap::new())?;

    let events = recorder.events();
    let sub = events
        .iter()
        .find(|recorded| recorded.event.node_name == "Sub")
        .expect("sub-process triggered");
    let inner = events
        .iter()
        .find(|recorded| recorded.event.node_name == "X")
        .expect("inner node triggered");
    assert_eq!(
        inner.event.node_instance_unique_id,
        format!("{}:{}", sub.event.node_instance, inner.event.node_instance)
    );
    assert_eq!(sub.event.node_instance_unique_id, sub.event.node_instance.to_string());
    Ok(())
}

#[test]
fn completing_a_removed_instance_is_a_no_op() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("order.idempotent", "Idempotent");
    builder
        .add_start("Start")
        .add_split("Fork", SplitKind::And)
        .add_custom("Left", "wait")
        .add_custom("Right", "wait")
        .add_end("EndLeft")
        .add_end("EndRight")
        .connect("Start", "Fork")
        .connect("Fork", "Left")
        .connect("Fork", "Right")
        .connect("Left", "EndLeft")
        .connect("Right", "EndRight");
    let definition = Arc::new(builder.build()?);

    for config in strategies() {
        let (mut instance, recorder) = launch(&definition, config, BTreeMap::new())?;
        let left = instance.node_instances_by_name("Left")[0];
        let right = instance.node_instances_by_name("Right")[0];

        instance.complete_node_instance(left)?;
        let completed = instance.completed_node_ids().to_vec();
        let left_events = recorder.count_for(EventPhase::BeforeLeft, left);

        instance.complete_node_instance(left)?;
        assert_eq!(instance.completed_node_ids(), completed.as_slice());
        assert_eq!(recorder.count_for(EventPhase::BeforeLeft, left), left_events);
        assert_eq!(instance.state(), ProcessState::Active);

        instance.complete_node_instance(right)?;
        assert_eq!(instance.state(), ProcessState::Completed);
    }
    Ok(())
}

#[test]
fn event_based_split_cancels_losing_branch() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("order.race", "Race");
    builder
        .add_start("Start")
        .add_split("Race", SplitKind::EventBased)
        .add_event_wait("Paid", "payment")
        .add_event_wait("Expired", "timeout")
        .add_end("EndPaid")
        .add_end("EndExpired")
        .connect("Start", "Race")
        .connect("Race", "Paid")
        .connect("Race", "Expired")
        .connect("Paid", "EndPaid")
        .connect("Expired", "EndExpired");
    let definition = Arc::new(builder.build()?);

    for config in strategies() {
        let (mut instance, recorder) = launch(&definition, config, BTreeMap::new())?;
        let expired = instance.node_instances_by_name("Expired")[0];
        assert_eq!(instance.node_instances().count(), 2);

        instance.signal_event("payment", json!({ "amount": 10 }))?;

        assert_eq!(instance.state(), ProcessState::Completed);
        let expired_uid = definition.node_by_name("Expired").map(|node| node.unique_id.clone());
        assert!(!instance
            .completed_node_ids()
            .iter()
            .any(|done| Some(done) == expired_uid.as_ref()));
        assert_eq!(recorder.count_for(EventPhase::AfterLeft, expired), 1);
        assert!(!recorder.triggered().contains(&"EndExpired".to_string()));

        let err = instance.signal_event("timeout", Value::Null).unwrap_err();
        assert!(matches!(err, ProcessError::InvalidState { .. }));
    }
    Ok(())
}

#[test]
fn event_based_split_discards_group_once_decided() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("order.race.hold", "Race then hold");
    builder
        .add_start("Start")
        .add_split("Race", SplitKind::EventBased)
        .add_event_wait("Paid", "payment")
        .add_event_wait("Expired", "timeout")
        .add_custom("Ship", "wait")
        .add_end("EndShip")
        .add_end("EndExpired")
        .connect("Start", "Race")
        .connect("Race", "Paid")
        .connect("Race", "Expired")
        .connect("Paid", "Ship")
        .connect("Ship", "EndShip")
        .connect("Expired", "EndExpired");
    let definition = Arc::new(builder.build()?);

    for config in strategies() {
        let (mut instance, _) = launch(&definition, config, BTreeMap::new())?;
        assert_eq!(
            instance.container(ContainerKey::Process).unwrap().exclusive_groups().len(),
            1
        );

        instance.signal_event("payment", Value::Null)?;

        assert_eq!(instance.state(), ProcessState::Active);
        assert!(instance.node_instances_by_name("Expired").is_empty());
        assert_eq!(instance.node_instances_by_name("Ship").len(), 1);
        assert!(instance
            .container(ContainerKey::Process)
            .unwrap()
            .exclusive_groups()
            .is_empty());

        // 落败分支的事件不再有接收者
        instance.signal_event("timeout", Value::Null)?;
        assert_eq!(instance.node_instances_by_name("Ship").len(), 1);
        assert_eq!(instance.state(), ProcessState::Active);
    }
    Ok(())
}

fn amount_at_least(limit: i64) -> procflow::Condition {
    condition_from_fn(move |ctx| {
        ctx.get_variable("amount")
            .and_then(|value| value.as_i64())
            .is_some_and(|amount| amount >= limit)
    })
}

fn routing_process(with_default: bool) -> anyhow::Result<Arc<ProcessDefinition>> {
    let mut builder = ProcessBuilder::new("order.routing", "Routing");
    builder
        .add_start("Start")
        .add_action("Check", action_noop())
        .add_action("Review", action_noop())
        .add_action("Escalate", action_noop())
        .add_action("Fallback", action_noop())
        .add_end("EndReview")
        .add_end("EndEscalate")
        .add_end("EndFallback")
        .connect("Start", "Check")
        .connect_with_constraint("Check", "Review", Constraint::when(2, amount_at_least(10)))
        .connect_with_constraint("Check", "Escalate", Constraint::when(1, amount_at_least(100)))
        .connect("Review", "EndReview")
        .connect("Escalate", "EndEscalate")
        .connect("Fallback", "EndFallback");
    if with_default {
        builder.connect_with_constraint("Check", "Fallback", Constraint::otherwise());
    }
    Ok(Arc::new(builder.build()?))
}

fn amount(value: i64) -> BTreeMap<String, Value> {
    BTreeMap::from([("amount".to_string(), json!(value))])
}

#[test]
fn multi_connection_takes_satisfied_exits_by_priority() -> anyhow::Result<()> {
    let definition = routing_process(true)?;
    for strategy in strategies() {
        let config = strategy.with_multi_connection(true);
        let (instance, recorder) = launch(&definition, config, amount(500))?;
        assert_eq!(instance.state(), ProcessState::Completed);
        assert_eq!(
            recorder.triggered(),
            vec!["Start", "Check", "Escalate", "EndEscalate", "Review", "EndReview"]
        );
    }
    Ok(())
}

#[test]
fn multi_connection_falls_back_to_default_exit() -> anyhow::Result<()> {
    let definition = routing_process(true)?;
    let config = EngineConfig::queue_based().with_multi_connection(true);
    let (instance, recorder) = launch(&definition, config, amount(5))?;
    assert_eq!(instance.state(), ProcessState::Completed);
    assert_eq!(recorder.triggered(), vec!["Start", "Check", "Fallback", "EndFallback"]);
    Ok(())
}

#[test]
fn multi_connection_without_valid_exit_faults() -> anyhow::Result<()> {
    let definition = routing_process(false)?;
    let recorder = EventRecorder::new();
    let environment = ProcessEnvironment::new().with_listener(recorder.clone()).into_shared();
    let mut instance = ProcessInstance::new(
        9,
        definition,
        environment,
        EngineConfig::recursive().with_multi_connection(true),
    );

    let err = instance.start(amount(5)).unwrap_err();
    assert!(matches!(&err, ProcessError::UnsatisfiedOutgoingFlow(node) if node == "Check"));
    assert_eq!(instance.state(), ProcessState::Active);
    let fault = instance.fault().expect("fault recorded");
    assert!(fault.message.contains("Check"));
    Ok(())
}

#[test]
fn xor_split_picks_first_satisfied_exit() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("order.xor", "Exclusive gateway");
    builder
        .add_start("Start")
        .add_split("Gate", SplitKind::Xor)
        .add_action("Large", action_noop())
        .add_action("Small", action_noop())
        .add_end("End")
        .connect("Start", "Gate")
        .connect_with_constraint("Gate", "Small", Constraint::when(5, amount_at_least(0)))
        .connect_with_constraint("Gate", "Large", Constraint::when(1, amount_at_least(100)))
        .connect("Large", "End")
        .connect("Small", "End");
    let definition = Arc::new(builder.build()?);

    for config in strategies() {
        let (_, large) = launch(&definition, config.clone(), amount(250))?;
        assert_eq!(large.triggered(), vec!["Start", "Gate", "Large", "End"]);
        let (_, small) = launch(&definition, config, amount(3))?;
        assert_eq!(small.triggered(), vec!["Start", "Gate", "Small", "End"]);
    }
    Ok(())
}
