use std::collections::BTreeMap;
use std::sync::Arc;

use procflow::flow::Constraint;
use procflow::{
    action_noop, condition_always, condition_variable_absent, condition_variable_equals,
    condition_variable_exists, condition_variable_not_equals, EngineConfig, EventRecorder,
    NodeContext, NodeHandler, NodeOutcome, ProcessBuilder, ProcessDefinition, ProcessEnvironment,
    ProcessError, ProcessInstance, ProcessState, SplitKind,
};
use serde_json::{json, Value};

/// 进入后一直等待，直到外部放行
struct HoldHandler;

impl NodeHandler for HoldHandler {
    fn enter(&self, _ctx: &mut NodeContext<'_>) -> anyhow::Result<NodeOutcome> {
        Ok(NodeOutcome::Wait)
    }
}

fn launch(
    definition: &Arc<ProcessDefinition>,
    config: EngineConfig,
    params: BTreeMap<String, Value>,
) -> anyhow::Result<(ProcessInstance, Arc<EventRecorder>)> {
    let recorder = EventRecorder::new();
    let environment = ProcessEnvironment::new()
        .with_listener(recorder.clone())
        .with_node_handler("hold", Arc::new(HoldHandler))
        .into_shared();
    let mut instance = ProcessInstance::new(1, Arc::clone(definition), environment, config);
    instance.start(params)?;
    Ok((instance, recorder))
}

fn params(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Or 网关：每条满足条件的出口都放行，没有满足项时走默认出口
fn routing_process() -> anyhow::Result<Arc<ProcessDefinition>> {
    let mut builder = ProcessBuilder::new("shipping.route", "Shipping route");
    builder
        .add_start("Start")
        .add_split("Route", SplitKind::Or)
        .add_end("Express")
        .add_end("Audit")
        .add_end("Standard")
        .add_end("Manual")
        .connect("Start", "Route")
        .connect_with_constraint(
            "Route",
            "Express",
            Constraint::when(1, condition_variable_equals("tier", "gold")),
        )
        .connect_with_constraint(
            "Route",
            "Audit",
            Constraint::when(2, condition_variable_exists("flagged")),
        )
        .connect_with_constraint(
            "Route",
            "Standard",
            Constraint::when(3, condition_variable_absent("tier")),
        )
        .connect_with_constraint("Route", "Manual", Constraint::otherwise());
    Ok(Arc::new(builder.build()?))
}

#[test]
fn or_split_follows_every_satisfied_constraint() -> anyhow::Result<()> {
    let definition = routing_process()?;
    for config in [EngineConfig::recursive(), EngineConfig::queue_based()] {
        let gold = params(&[("tier", json!("gold")), ("flagged", json!(true))]);
        let (instance, recorder) = launch(&definition, config.clone(), gold)?;
        assert_eq!(instance.state(), ProcessState::Completed);
        assert_eq!(recorder.triggered(), vec!["Start", "Route", "Express", "Audit"]);

        let (_, recorder) = launch(&definition, config.clone(), BTreeMap::new())?;
        assert_eq!(recorder.triggered(), vec!["Start", "Route", "Standard"]);

        // null 视为不存在
        let silver = params(&[("tier", json!("silver")), ("flagged", Value::Null)]);
        let (instance, recorder) = launch(&definition, config, silver)?;
        assert_eq!(instance.state(), ProcessState::Completed);
        assert_eq!(recorder.triggered(), vec!["Start", "Route", "Manual"]);
    }
    Ok(())
}

#[test]
fn xor_split_takes_first_satisfied_by_priority() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("ticket.gate", "Ticket gate");
    builder
        .add_start("Start")
        .add_split("Gate", SplitKind::Xor)
        .add_end("Closed")
        .add_end("Open")
        .connect("Start", "Gate")
        // 声明顺序与优先级相反
        .connect_with_constraint("Gate", "Closed", Constraint::when(5, condition_always()))
        .connect_with_constraint(
            "Gate",
            "Open",
            Constraint::when(1, condition_variable_not_equals("status", "closed")),
        );
    let definition = Arc::new(builder.build()?);

    let (_, recorder) = launch(&definition, EngineConfig::recursive(), BTreeMap::new())?;
    assert_eq!(recorder.triggered(), vec!["Start", "Gate", "Open"]);

    let closed = params(&[("status", json!("closed"))]);
    let (_, recorder) = launch(&definition, EngineConfig::queue_based(), closed)?;
    assert_eq!(recorder.triggered(), vec!["Start", "Gate", "Closed"]);
    Ok(())
}

#[test]
fn xor_split_without_match_or_default_is_a_runtime_fault() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("ticket.strict", "Strict gate");
    builder
        .add_start("Start")
        .add_split("Gate", SplitKind::Xor)
        .add_end("Open")
        .connect("Start", "Gate")
        .connect_with_constraint(
            "Gate",
            "Open",
            Constraint::when(1, condition_variable_equals("status", "open")),
        );
    let definition = Arc::new(builder.build()?);
    let environment = ProcessEnvironment::new().into_shared();
    let mut instance = ProcessInstance::new(1, definition, environment, EngineConfig::recursive());

    let err = instance.start(BTreeMap::new()).unwrap_err();

    assert!(matches!(err, ProcessError::UnsatisfiedOutgoingFlow(ref node) if node == "Gate"));
    assert!(instance.fault().is_some());
    Ok(())
}

fn desk_process() -> anyhow::Result<Arc<ProcessDefinition>> {
    let mut builder = ProcessBuilder::new("support.desk", "Support desk");
    builder
        .add_start("Start")
        .add_custom("Hold", "hold")
        .add_end("End")
        .add_action("Escalate", action_noop())
        .add_end("Escalated")
        .connect("Start", "Hold")
        .connect("Hold", "End")
        .connect("Escalate", "Escalated");
    Ok(Arc::new(builder.build()?))
}

#[test]
fn trigger_node_enters_sibling_without_connection() -> anyhow::Result<()> {
    let definition = desk_process()?;
    let escalate = definition
        .node_by_name("Escalate")
        .map(|node| node.id)
        .expect("escalate node");
    for config in [EngineConfig::recursive(), EngineConfig::queue_based()] {
        let (mut instance, recorder) = launch(&definition, config, BTreeMap::new())?;
        let hold = instance.node_instances_by_name("Hold")[0];
        let cached = instance
            .node_instance(hold)
            .and_then(|node| node.cached_unique_id().map(str::to_string));
        assert_eq!(cached, Some(hold.to_string()));

        instance.trigger_node(hold, escalate)?;

        assert_eq!(instance.state(), ProcessState::Active);
        assert_eq!(recorder.triggered(), vec!["Start", "Hold", "Escalate", "Escalated"]);
        assert_eq!(instance.node_instances_by_name("Hold"), vec![hold]);

        instance.complete_node_instance(hold)?;
        assert_eq!(instance.state(), ProcessState::Completed);
    }
    Ok(())
}

#[test]
fn retrigger_replaces_or_duplicates_node_instance() -> anyhow::Result<()> {
    let definition = desk_process()?;

    let (mut instance, _) = launch(&definition, EngineConfig::recursive(), BTreeMap::new())?;
    let first = instance.node_instances_by_name("Hold")[0];
    instance.retrigger_node_instance(first, true)?;
    let replaced = instance.node_instances_by_name("Hold");
    assert_eq!(replaced.len(), 1);
    assert_ne!(replaced[0], first);
    instance.complete_node_instance(replaced[0])?;
    assert_eq!(instance.state(), ProcessState::Completed);

    let (mut instance, _) = launch(&definition, EngineConfig::queue_based(), BTreeMap::new())?;
    let first = instance.node_instances_by_name("Hold")[0];
    instance.retrigger_node_instance(first, false)?;
    let held = instance.node_instances_by_name("Hold");
    assert_eq!(held.len(), 2);
    instance.complete_node_instance(held[0])?;
    assert_eq!(instance.state(), ProcessState::Active);
    instance.complete_node_instance(held[1])?;
    assert_eq!(instance.state(), ProcessState::Completed);

    let err = instance.retrigger_node_instance(first, true).unwrap_err();
    assert!(matches!(err, ProcessError::InvalidState { .. }));
    Ok(())
}

#[test]
fn signal_to_node_instance_checks_type_and_target() -> anyhow::Result<()> {
    let mut builder = ProcessBuilder::new("expense.approval", "Expense approval");
    builder
        .add_start("Start")
        .add_event_wait("Approval", "approve")
        .set_event_variable("Approval", "decision")
        .add_end("End")
        .connect("Start", "Approval")
        .connect("Approval", "End");
    let definition = Arc::new(builder.build()?);
    let (mut instance, _) = launch(&definition, EngineConfig::queue_based(), BTreeMap::new())?;
    let waiting = instance.node_instances_by_name("Approval")[0];

    let err = instance
        .signal_event_to(999, "approve", json!("yes"))
        .unwrap_err();
    assert!(matches!(err, ProcessError::UnknownNodeInstance(999)));

    instance.signal_event_to(waiting, "reject", json!("no"))?;
    assert_eq!(instance.state(), ProcessState::Active);
    assert_eq!(instance.get_variable("decision"), None);

    instance.signal_event_to(waiting, "approve", json!("yes"))?;
    assert_eq!(instance.state(), ProcessState::Completed);
    assert_eq!(instance.get_variable("decision"), Some(json!("yes")));
    Ok(())
}
