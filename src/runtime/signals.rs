use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{ProcessError, Result};
use crate::flow::constants::{connection, events};
use crate::flow::contexts::{CompensationHandler, ContextKind};
use crate::flow::nodes::{NodeKind, StartNode};
use crate::flow::types::{ContainerDef, NodeId};
use crate::runtime::container::{ContainerKey, ContainerKind, ContainerState, NodeInstanceContainer};
use crate::runtime::node_instance::{NodeInstanceId, NodeInstanceState};
use crate::runtime::process_instance::{ProcessInstance, ProcessState};
use crate::runtime::queue::QueuedAction;
use crate::runtime::scope::ContextAnchor;
use crate::state::CompensationRecord;

fn payload_type(payload: &Value) -> &'static str {
    match payload {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl ProcessInstance {
    /// 流程级事件分发
    ///
    /// 顺序：等待中的事件节点、附着活动仍活动的边界事件、匹配的事件子流程。
    /// 每个接收者在独立的执行单元中处理。
    pub(crate) fn dispatch_signal(&mut self, event_type: &str, payload: &Value) -> Result<()> {
        if event_type == events::COMPENSATION {
            return self.signal_compensation(payload);
        }
        let definition = Arc::clone(&self.definition);

        let waiting: Vec<NodeInstanceId> = self
            .node_instances
            .values()
            .filter(|instance| {
                matches!(
                    definition.node(instance.node_id).map(|node| &node.kind),
                    Some(NodeKind::EventWait { event_type: waits_for, .. }) if waits_for == event_type
                )
            })
            .map(|instance| instance.id)
            .collect();
        for id in waiting {
            if self.is_live(id) && self.is_active() {
                self.run_isolated(|pi| pi.receive_event(id, payload))?;
            }
        }

        let boundaries: Vec<(NodeId, NodeId, bool)> = definition
            .nodes()
            .filter_map(|node| match &node.kind {
                NodeKind::BoundaryEvent(boundary)
                    if boundary.event_type == event_type
                        && boundary.event_type != events::COMPENSATION =>
                {
                    Some((node.id, boundary.attached_to, boundary.cancel_activity))
                }
                _ => None,
            })
            .collect();
        for (boundary, attached_to, cancel_activity) in boundaries {
            for attached in self.node_instances_of(attached_to) {
                if self.is_live(attached) && self.is_active() {
                    self.run_isolated(|pi| pi.signal_boundary(boundary, attached, cancel_activity))?;
                }
            }
        }

        let sub_processes: Vec<NodeId> = definition
            .nodes()
            .filter(|node| matches!(node.kind, NodeKind::EventSubProcess(_)))
            .filter(|node| {
                definition
                    .event_start_node(ContainerDef::Node(node.id), event_type)
                    .is_some()
            })
            .map(|node| node.id)
            .collect();
        for esp in sub_processes {
            for host in self.event_sub_process_hosts(esp) {
                if self.is_container_active(host) {
                    self.run_isolated(|pi| {
                        pi.start_event_sub_process(esp, host, event_type, payload.clone())
                            .map(|_| ())
                    })?;
                }
            }
        }
        Ok(())
    }

    /// 向指定节点实例发送事件
    pub(crate) fn signal_node_instance(
        &mut self,
        id: NodeInstanceId,
        event_type: &str,
        payload: &Value,
    ) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let node_id = self
            .node_instances
            .get(&id)
            .map(|instance| instance.node_id)
            .ok_or(ProcessError::UnknownNodeInstance(id))?;
        match &definition.require_node(node_id)?.kind {
            NodeKind::EventWait {
                event_type: waits_for,
                ..
            } if waits_for == event_type => self.receive_event(id, payload),
            other => {
                debug!(
                    node_instance = id,
                    kind = other.kind_name(),
                    event_type,
                    "event ignored by node instance"
                );
                Ok(())
            }
        }
    }

    /// 等待事件节点收到事件：写入变量后离开
    fn receive_event(&mut self, id: NodeInstanceId, payload: &Value) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let Some(instance) = self.node_instances.get(&id) else {
            return Ok(());
        };
        let anchor = ContextAnchor::new(instance.node_id, instance.container);
        if let Some(NodeKind::EventWait {
            variable: Some(variable),
            ..
        }) = definition.node(anchor.node_id).map(|node| &node.kind)
        {
            self.write_variable(&anchor, variable, payload.clone());
        }
        self.trigger_completed(id, connection::DEFAULT_TYPE, true)
    }

    /// 边界事件：在附着活动所在容器中新建实例并放行
    ///
    /// 中断型边界事件先取消附着活动。
    fn signal_boundary(
        &mut self,
        boundary: NodeId,
        attached: NodeInstanceId,
        cancel_activity: bool,
    ) -> Result<()> {
        let Some(container) = self.node_instances.get(&attached).map(|instance| instance.container)
        else {
            return Ok(());
        };
        let id = self.create_node_instance(container, boundary)?;
        if cancel_activity {
            debug!(node_instance = attached, boundary = id, "boundary event interrupts activity");
            self.cancel_node_instance(attached)?;
        }
        self.trigger_completed(id, connection::DEFAULT_TYPE, true)
    }

    /// 事件子流程可以在哪些活动容器中启动
    fn event_sub_process_hosts(&self, esp: NodeId) -> Vec<ContainerKey> {
        let Some(node) = self.definition.node(esp) else {
            return Vec::new();
        };
        match node.container {
            ContainerDef::Process => vec![ContainerKey::Process],
            ContainerDef::Node(parent) => self
                .node_instances_of(parent)
                .into_iter()
                .map(ContainerKey::Node)
                .filter(|key| {
                    self.containers
                        .get(key)
                        .is_some_and(|container| container.kind == ContainerKind::SubProcess)
                })
                .collect(),
        }
    }

    /// 启动事件子流程
    ///
    /// 每个事件新建一个事件子流程实例和其事件开始节点实例。
    pub(crate) fn start_event_sub_process(
        &mut self,
        esp: NodeId,
        host: ContainerKey,
        event_type: &str,
        payload: Value,
    ) -> Result<NodeInstanceId> {
        let definition = Arc::clone(&self.definition);
        let start = definition
            .event_start_node(ContainerDef::Node(esp), event_type)
            .ok_or_else(|| {
                ProcessError::UnknownNode(format!("start event `{event_type}` in node {esp}"))
            })?;

        let esp_instance = self.create_node_instance(host, esp)?;
        if let Some(instance) = self.node_instances.get_mut(&esp_instance) {
            instance.state = NodeInstanceState::EventSubProcess {
                start: Some(start.id),
            };
        }
        let start_instance = self.create_node_instance(ContainerKey::Node(esp_instance), start.id)?;
        debug!(
            process_instance = self.id,
            node_instance = esp_instance,
            event_type,
            "event sub-process started"
        );

        if self.is_queue_based() {
            let event_type = event_type.to_string();
            self.run_isolated(move |pi| {
                pi.enqueue(QueuedAction::SignalStart {
                    node_instance: start_instance,
                    event_type,
                    payload,
                });
                Ok(())
            })?;
        } else {
            self.signal_start(start_instance, event_type, &payload)?;
        }
        Ok(esp_instance)
    }

    /// 事件开始节点收到事件：写入变量后进入
    pub(crate) fn signal_start(
        &mut self,
        id: NodeInstanceId,
        _event_type: &str,
        payload: &Value,
    ) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let Some(instance) = self.node_instances.get(&id) else {
            return Ok(());
        };
        let anchor = ContextAnchor::new(instance.node_id, instance.container);
        if let Some(NodeKind::Start(StartNode {
            variable: Some(variable),
            ..
        })) = definition.node(anchor.node_id).map(|node| &node.kind)
        {
            self.write_variable(&anchor, variable, payload.clone());
        }
        self.trigger_node_instance(id, None, connection::DEFAULT_TYPE)
    }

    /// 事件子流程内部到达结束节点
    ///
    /// 保持活动时完成自身。中断型开始节点不走完成检查，直接中止宿主：
    /// 流程宿主以故障码为结果中止；子流程宿主被取消，其外层容器随后做空闲检查。
    pub(crate) fn event_sub_process_completed(&mut self, esp_instance: NodeInstanceId) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let Some(instance) = self.node_instances.get(&esp_instance) else {
            return Ok(());
        };
        let host = instance.container;
        let node = definition.require_node(instance.node_id)?;
        let start = match instance.state {
            NodeInstanceState::EventSubProcess { start } => start,
            _ => None,
        };
        let keep_active = matches!(&node.kind, NodeKind::EventSubProcess(esp) if esp.keep_active);
        if !keep_active {
            return Ok(());
        }
        let interrupting = match start.and_then(|id| definition.node(id)).map(|start| &start.kind) {
            Some(NodeKind::Start(start)) if start.interrupting => Some(start),
            _ => None,
        };

        match (interrupting, host) {
            (Some(start), ContainerKey::Process) => {
                self.completed.push(node.unique_id.clone());
                self.cancel_node_instance(esp_instance)?;
                if self.state != ProcessState::Active {
                    return Ok(());
                }
                let outcome = start
                    .fault_code
                    .clone()
                    .or_else(|| self.outcome.clone())
                    .unwrap_or_default();
                debug!(
                    process_instance = self.id,
                    outcome = %outcome,
                    "interrupting event sub-process aborts process instance"
                );
                self.terminate(ProcessState::Aborted, Some(outcome))
            }
            (Some(_), ContainerKey::Node(owner)) => {
                self.completed.push(node.unique_id.clone());
                self.cancel_node_instance(esp_instance)?;
                let Some(parent) = self.node_instances.get(&owner).map(|owner| owner.container) else {
                    return Ok(());
                };
                debug!(node_instance = owner, "interrupting event sub-process aborts container");
                if let Some(container) = self.containers.get_mut(&host) {
                    container.state = ContainerState::Aborted;
                }
                self.cancel_node_instance(owner)?;
                self.complete_container_if_idle(parent)
            }
            _ => self.trigger_completed(esp_instance, connection::DEFAULT_TYPE, true),
        }
    }

    /// "Compensation" 事件
    ///
    /// 载荷为活动唯一 ID（指定补偿）或 `implicit:<容器唯一 ID>`（整体补偿）；
    /// 找不到目标时忽略。
    pub(crate) fn signal_compensation(&mut self, payload: &Value) -> Result<()> {
        let Value::String(activity_ref) = payload else {
            return Err(ProcessError::InvalidSignalPayload(payload_type(payload).to_string()));
        };
        let definition = Arc::clone(&self.definition);

        let scope = match activity_ref.strip_prefix(events::IMPLICIT_COMPENSATION_PREFIX) {
            Some(target) if target == definition.id => Some(ContainerDef::Process),
            Some(target) => definition
                .find_node_by_unique_id(target)
                .filter(|node| node.is_composite())
                .map(|node| ContainerDef::Node(node.id)),
            None => definition.find_node_by_unique_id(activity_ref).map(|node| {
                definition
                    .resolve_context(node.id, ContextKind::Compensation, activity_ref)
                    .unwrap_or(node.container)
            }),
        };
        let Some(scope) = scope else {
            debug!(activity_ref = %activity_ref, "compensation target not found, ignoring");
            return Ok(());
        };
        self.handle_compensation(scope, activity_ref)
    }

    /// 在补偿作用域中执行补偿
    pub(crate) fn handle_compensation(&mut self, scope: ContainerDef, activity_ref: &str) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let handlers = definition
            .contexts(scope)
            .and_then(|decls| decls.compensation.as_ref());

        if activity_ref.starts_with(events::IMPLICIT_COMPENSATION_PREFIX) {
            let Some(handlers) = handlers else {
                return Ok(());
            };
            let completed = self.completed.clone();
            for completed_id in completed.iter().rev() {
                if let Some(handler) = handlers.handlers.get(completed_id) {
                    self.invoke_compensation_handler(scope, *handler, completed_id)?;
                }
            }
            Ok(())
        } else {
            let handler = handlers
                .and_then(|scope| scope.handlers.get(activity_ref))
                .ok_or_else(|| ProcessError::UnknownCompensationHandler(activity_ref.to_string()))?;
            self.invoke_compensation_handler(scope, *handler, activity_ref)
        }
    }

    fn compensation_container(&mut self, scope: ContainerDef) -> ContainerKey {
        let key = ContainerKey::Compensation(scope);
        self.containers
            .entry(key)
            .or_insert_with(|| NodeInstanceContainer::new(key, ContainerKind::Compensation, scope));
        key
    }

    /// 调用单个补偿处理器
    ///
    /// 处理器实例在补偿容器中运行，层级为流程当前层级加一。
    fn invoke_compensation_handler(
        &mut self,
        scope: ContainerDef,
        handler: CompensationHandler,
        activity_ref: &str,
    ) -> Result<()> {
        let key = self.compensation_container(scope);
        let level = self.current_level() + 1;
        self.container_mut(key)?.set_current_level(level);
        trace!(scope = %scope, activity_ref, level, "invoking compensation handler");

        let result = self.run_isolated(|pi| match handler {
            CompensationHandler::BoundaryEvent { node, attached_to } => {
                let id = pi.create_node_instance(key, node)?;
                pi.record_compensation(key, scope, activity_ref, node, id)?;
                pi.signal_compensation_boundary(id, attached_to)
            }
            CompensationHandler::EventSubProcess { node, parent } => {
                let parent_completed = pi
                    .definition
                    .container_unique_id(parent)
                    .is_some_and(|parent_id| pi.completed.iter().any(|done| done == parent_id));
                if !parent_completed {
                    debug!(activity_ref, "parent not completed, compensation skipped");
                    return Ok(());
                }
                let id = pi.start_event_sub_process(
                    node,
                    key,
                    events::COMPENSATION,
                    Value::String(activity_ref.to_string()),
                )?;
                pi.record_compensation(key, scope, activity_ref, node, id)
            }
        });
        result.map_err(|err| {
            ProcessError::runtime(
                None,
                self.id,
                "Unable to execute compensation.",
                Some(anyhow::Error::new(err)),
            )
        })
    }

    fn record_compensation(
        &mut self,
        key: ContainerKey,
        scope: ContainerDef,
        activity_ref: &str,
        handler_node: NodeId,
        node_instance: NodeInstanceId,
    ) -> Result<()> {
        self.container_mut(key)?
            .contexts_mut()
            .compensation_or_init(scope)
            .push(CompensationRecord {
                activity_ref: activity_ref.to_string(),
                handler_node,
                node_instance,
            });
        Ok(())
    }

    /// 补偿边界事件只在附着活动已完成且不再活动时放行
    fn signal_compensation_boundary(&mut self, id: NodeInstanceId, attached_to: NodeId) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let attached = definition.require_node(attached_to)?;
        let attached_live = !self.node_instances_of(attached_to).is_empty();
        let attached_completed = self.completed.iter().any(|done| *done == attached.unique_id);
        if attached_live || !attached_completed {
            debug!(
                node_instance = id,
                activity = %attached.name,
                attached_live,
                attached_completed,
                "compensation boundary not applicable"
            );
            self.detach(id)?;
            return Ok(());
        }
        self.trigger_completed(id, connection::DEFAULT_TYPE, true)
    }
}
