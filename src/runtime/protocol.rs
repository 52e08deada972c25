use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{ProcessError, Result};
use crate::flow::connections::ConnectionDefinition;
use crate::flow::constants::connection;
use crate::flow::nodes::{NodeDefinition, NodeKind};
use crate::flow::types::{ContainerDef, NodeId, ProcessDefinition};
use crate::runtime::container::{
    ContainerKey, ContainerKind, ContainerState, ExclusiveGroupInstance, NodeInstanceContainer,
};
use crate::runtime::events::NodeEvent;
use crate::runtime::node_instance::{NodeInstance, NodeInstanceId, NodeInstanceState, TriggerSource};
use crate::runtime::process_instance::{ProcessInstance, ProcessState};
use crate::runtime::queue::QueuedAction;
use crate::runtime::scope::{ConditionContext, ContextAnchor};

/// 节点离开时的出口选择方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Route<'a> {
    /// 指定类型的全部出口（多连接模式下按优先级评估）
    Type(&'a str),
    /// 优先级最高的满足条件的出口
    First,
    /// 所有满足条件的出口
    Satisfied,
    /// 所有出口，下游实例组成互斥组
    Exclusive,
}

impl ProcessInstance {
    /// 在容器中创建节点实例
    ///
    /// 汇聚网关复用当前层级上已有的活动实例；复合节点同时创建其子容器。
    pub(crate) fn create_node_instance(
        &mut self,
        container: ContainerKey,
        node_id: NodeId,
    ) -> Result<NodeInstanceId> {
        let definition = Arc::clone(&self.definition);
        let node = definition.require_node(node_id)?;
        let loop_level_disabled = self.config.loop_level_disabled;

        if matches!(node.kind, NodeKind::Join(_)) {
            let owner = self.require_container(container)?;
            let current_level = owner.current_level();
            let reused = owner.node_instances().iter().copied().find(|id| {
                self.node_instances
                    .get(id)
                    .is_some_and(|live| live.node_id == node_id && live.level == current_level)
            });
            if let Some(id) = reused {
                trace!(node_instance = id, node = %node.name, "reusing join instance");
                return Ok(id);
            }
        }

        let level = self
            .container_mut(container)?
            .level_for_node(&node.unique_id, loop_level_disabled);
        let id = self.allocate_node_instance_id();
        let mut instance = NodeInstance::new(id, node_id, container, level, node.hidden);
        instance.state = Self::initial_state(&node.kind);
        self.node_instances.insert(id, instance);
        self.container_mut(container)?.add(id);

        let child_kind = match node.kind {
            NodeKind::SubProcess => Some(ContainerKind::SubProcess),
            NodeKind::EventSubProcess(_) => Some(ContainerKind::EventSubProcess),
            _ => None,
        };
        if let Some(kind) = child_kind {
            let key = ContainerKey::Node(id);
            self.containers
                .insert(key, NodeInstanceContainer::new(key, kind, ContainerDef::Node(node_id)));
        }

        trace!(
            process_instance = self.id,
            node_instance = id,
            node = %node.name,
            level,
            container = %container,
            "node instance created"
        );
        Ok(id)
    }

    /// 进入节点实例
    ///
    /// `from` 为空表示由引擎直接进入（开始节点、异常处理器、补偿处理器）。
    pub(crate) fn trigger_node_instance(
        &mut self,
        id: NodeInstanceId,
        from: Option<TriggerSource>,
        conn_type: &str,
    ) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let Some(instance) = self.node_instances.get(&id) else {
            trace!(node_instance = id, "trigger ignored, node instance no longer live");
            return Ok(());
        };
        let container = instance.container;
        let node_id = instance.node_id;
        let hidden = instance.metadata.hidden;

        if let Some(source) = &from {
            self.container_mut(container)?.set_current_level(source.level);
            let incoming = definition
                .incoming_connections(node_id, conn_type)
                .find(|conn| conn.from == source.node_id)
                .map(|conn| conn.unique_id.clone());
            if let (Some(incoming), Some(instance)) = (incoming, self.node_instances.get_mut(&id)) {
                instance.metadata.incoming_connection = Some(incoming);
            }
        }

        let event = if hidden { None } else { self.node_event(id) };
        if let Some(event) = &event {
            self.fire(|listener| listener.before_node_triggered(event));
        }
        debug!(
            process_instance = self.id,
            node_instance = id,
            node_id,
            "node triggered"
        );

        let process_instance = self.id;
        self.enter_node(id, from.as_ref(), conn_type)
            .map_err(|err| match err {
                ProcessError::Other(cause) => ProcessError::runtime(
                    Some(id),
                    process_instance,
                    cause.to_string(),
                    Some(cause),
                ),
                typed => typed,
            })?;

        if let Some(event) = &event {
            self.fire(|listener| listener.after_node_triggered(event));
        }
        Ok(())
    }

    /// 节点实例完成，沿 `conn_type` 类型的出口离开
    pub(crate) fn trigger_completed(
        &mut self,
        id: NodeInstanceId,
        conn_type: &str,
        remove: bool,
    ) -> Result<()> {
        self.leave(id, remove, Route::Type(conn_type))
    }

    /// 完成日志、层级清理、移除、出口选择与下游触发
    pub(crate) fn leave(&mut self, id: NodeInstanceId, remove: bool, route: Route<'_>) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let Some(instance) = self.node_instances.get(&id) else {
            return Ok(());
        };
        let source = TriggerSource::of(instance);
        let hidden = instance.metadata.hidden;
        let node = definition.require_node(source.node_id)?;

        self.completed.push(node.unique_id.clone());
        if let Some(container) = self.containers.get_mut(&source.container) {
            container.clear_iteration_level(&node.unique_id);
        }
        if !self.is_container_active(source.container) {
            trace!(node_instance = id, "completion ignored, container is not active");
            return Ok(());
        }

        let event = if hidden { None } else { self.node_event(id) };
        if remove {
            self.detach(id)?;
        }

        let anchor = ContextAnchor::new(node.id, source.container);
        let connections: Vec<&ConnectionDefinition> = match route {
            Route::Type(_)
                if self.config.multi_connection && definition.has_constraints(node.id) =>
            {
                self.select_connections(&definition, node, &anchor, SelectMode::Priority)?
            }
            Route::Type(conn_type) => definition.outgoing_connections(node.id, conn_type).collect(),
            Route::First => self.select_connections(&definition, node, &anchor, SelectMode::First)?,
            Route::Satisfied => {
                self.select_connections(&definition, node, &anchor, SelectMode::Satisfied)?
            }
            Route::Exclusive => definition
                .outgoing_connections(node.id, connection::DEFAULT_TYPE)
                .collect(),
        };

        if connections.is_empty() {
            if let Some(event) = &event {
                self.fire(|listener| listener.before_node_left(event));
            }
            self.node_instance_completed(source.container, node)?;
            if let Some(event) = &event {
                self.fire(|listener| listener.after_node_left(event));
            }
            return Ok(());
        }

        let mut targets = Vec::with_capacity(connections.len());
        for conn in connections {
            targets.push((self.follow_connection(&source, conn)?, conn));
        }
        if route == Route::Exclusive && targets.len() > 1 {
            let members = targets.iter().map(|(target, _)| *target).collect();
            self.container_mut(source.container)?
                .add_exclusive_group(ExclusiveGroupInstance::new(members));
        }
        self.trigger_node_instances(&source, event.as_ref(), targets)
    }

    /// 按约束选择出口
    ///
    /// 约束按优先级升序评估，同优先级保持声明顺序；无满足项时使用默认出口。
    fn select_connections<'d>(
        &self,
        definition: &'d ProcessDefinition,
        node: &NodeDefinition,
        anchor: &ContextAnchor,
        mode: SelectMode,
    ) -> Result<Vec<&'d ConnectionDefinition>> {
        let outgoing: Vec<&ConnectionDefinition> = definition
            .outgoing_connections(node.id, connection::DEFAULT_TYPE)
            .collect();

        let mut candidates: Vec<(i32, &ConnectionDefinition)> = outgoing
            .iter()
            .filter_map(|conn| match &conn.constraint {
                Some(constraint) if constraint.is_default => None,
                Some(constraint) => Some((constraint.priority, *conn)),
                None if mode == SelectMode::Priority => None,
                None => Some((i32::MAX, *conn)),
            })
            .collect();
        candidates.sort_by_key(|(priority, _)| *priority);

        let ctx = ConditionContext::new(self, *anchor);
        let mut selected = Vec::new();
        for (_, conn) in candidates {
            let satisfied = conn
                .constraint
                .as_ref()
                .and_then(|constraint| constraint.condition.as_ref())
                .map_or(true, |condition| condition(&ctx));
            if satisfied {
                selected.push(conn);
                if mode == SelectMode::First {
                    break;
                }
            }
        }
        if !selected.is_empty() {
            return Ok(selected);
        }

        let fallback = outgoing.iter().copied().find(|conn| {
            conn.constraint
                .as_ref()
                .is_some_and(|constraint| constraint.is_default)
        });
        match fallback {
            Some(conn) => Ok(vec![conn]),
            None => Err(ProcessError::UnsatisfiedOutgoingFlow(node.name.clone())),
        }
    }

    /// 沿连接创建下游实例
    ///
    /// 来源属于互斥组时先取消组内其他成员并丢弃该组。
    pub(crate) fn follow_connection(
        &mut self,
        source: &TriggerSource,
        conn: &ConnectionDefinition,
    ) -> Result<NodeInstanceId> {
        let group = self
            .containers
            .get_mut(&source.container)
            .and_then(|container| container.take_exclusive_group(source.node_instance));
        if let Some(group) = group {
            for member in group.members() {
                if *member != source.node_instance {
                    debug!(
                        node_instance = member,
                        winner = source.node_instance,
                        "cancelling exclusive group member"
                    );
                    self.cancel_node_instance(*member)?;
                }
            }
        }
        self.create_node_instance(source.container, conn.to)
    }

    /// 依次触发下游实例；队列模式逆序入队，使弹出顺序与递归模式一致
    fn trigger_node_instances(
        &mut self,
        source: &TriggerSource,
        event: Option<&NodeEvent>,
        mut targets: Vec<(NodeInstanceId, &ConnectionDefinition)>,
    ) -> Result<()> {
        if self.is_queue_based() {
            targets.reverse();
        }
        for (target, conn) in targets {
            if !self.is_container_active(source.container) {
                return Ok(());
            }
            if let Some(event) = event {
                self.fire(|listener| listener.before_node_left(event));
            }
            if self.is_queue_based() {
                self.enqueue(QueuedAction::Trigger {
                    node_instance: target,
                    from: Some(source.clone()),
                    conn_type: conn.to_type.clone(),
                });
            } else {
                self.trigger_node_instance(target, Some(source.clone()), &conn.to_type)?;
            }
            if let Some(instance) = self.node_instances.get_mut(&source.node_instance) {
                instance.metadata.outgoing_connection = Some(conn.unique_id.clone());
            }
            if let Some(event) = event {
                self.fire(|listener| listener.after_node_left(event));
            }
        }
        Ok(())
    }

    /// 从活动集合移除，并清理实例持有的资源
    ///
    /// 复合实例先取消子实例（此时自身仍在，子实例唯一 ID 可计算），再移除子容器。
    pub(crate) fn detach(&mut self, id: NodeInstanceId) -> Result<Option<NodeInstance>> {
        let child_key = ContainerKey::Node(id);
        if let Some(children) = self
            .containers
            .get(&child_key)
            .map(|container| container.node_instances().to_vec())
        {
            for child in children.into_iter().rev() {
                self.cancel_node_instance(child)?;
            }
            self.containers.remove(&child_key);
        }

        let Some(instance) = self.node_instances.remove(&id) else {
            return Ok(None);
        };
        if let Some(container) = self.containers.get_mut(&instance.container) {
            container.remove(id);
        }

        if let NodeInstanceState::WorkItem { work_item_id } = instance.state {
            if let Some(item) = self.work_items.remove(&work_item_id) {
                if let Some(handler) = self.environment.work_item_handler(&item.name) {
                    handler.abort(&item);
                }
                debug!(work_item = work_item_id, node_instance = id, "work item aborted");
            }
        }
        Ok(Some(instance))
    }

    /// 取消节点实例：移除并发出 "after left"
    pub(crate) fn cancel_node_instance(&mut self, id: NodeInstanceId) -> Result<()> {
        let Some(instance) = self.node_instances.get(&id) else {
            return Ok(());
        };
        let event = if instance.metadata.hidden {
            None
        } else {
            self.node_event(id)
        };
        self.detach(id)?;
        debug!(process_instance = self.id, node_instance = id, "node instance cancelled");
        if let Some(event) = &event {
            self.fire(|listener| listener.after_node_left(event));
        }
        Ok(())
    }

    /// 没有出口的节点完成后通知所在容器
    fn node_instance_completed(&mut self, container: ContainerKey, node: &NodeDefinition) -> Result<()> {
        if node.for_compensation {
            return Ok(());
        }
        if matches!(node.kind, NodeKind::EventSubProcess(_)) {
            return match container {
                ContainerKey::Compensation(_) => Ok(()),
                _ => self.complete_container_if_idle(container),
            };
        }
        Err(ProcessError::UncontrolledFlow(node.name.clone()))
    }

    /// 结束节点到达
    pub(crate) fn end_reached(&mut self, container: ContainerKey, terminate: bool) -> Result<()> {
        let kind = self.require_container(container)?.kind;
        if terminate {
            match container {
                ContainerKey::Process => {
                    return self.terminate(ProcessState::Completed, None);
                }
                _ => {
                    let remaining = self.require_container(container)?.node_instances().to_vec();
                    for id in remaining {
                        self.cancel_node_instance(id)?;
                    }
                }
            }
        }
        match (container, kind) {
            (ContainerKey::Node(owner), ContainerKind::EventSubProcess) => {
                self.event_sub_process_completed(owner)
            }
            (ContainerKey::Compensation(_), _) => Ok(()),
            _ => self.complete_container_if_idle(container),
        }
    }

    /// 容器中没有阻塞的活动实例时完成容器
    ///
    /// 事件子流程实例只是在等待事件，不阻止容器完成。
    pub(crate) fn complete_container_if_idle(&mut self, container: ContainerKey) -> Result<()> {
        if !self.is_container_active(container) {
            return Ok(());
        }
        let blocking = self.require_container(container)?.node_instances().iter().any(|id| {
            self.node_instances
                .get(id)
                .and_then(|instance| self.definition.node(instance.node_id))
                .is_some_and(|node| !matches!(node.kind, NodeKind::EventSubProcess(_)))
        });
        if blocking {
            return Ok(());
        }
        match container {
            ContainerKey::Process => self.terminate(ProcessState::Completed, None),
            ContainerKey::Node(owner) => {
                self.container_mut(container)?.state = ContainerState::Completed;
                debug!(node_instance = owner, "sub-process completed");
                self.trigger_completed(owner, connection::DEFAULT_TYPE, true)
            }
            ContainerKey::Compensation(_) => Ok(()),
        }
    }

    /// 从已有实例出发，再次进入其节点
    pub(crate) fn retrigger(&mut self, id: NodeInstanceId, remove: bool) -> Result<()> {
        let source = self
            .trigger_source(id)
            .ok_or(ProcessError::UnknownNodeInstance(id))?;
        if remove {
            self.cancel_node_instance(id)?;
        }
        self.trigger_node_with_source(&source, source.node_id)
    }

    /// 从已有实例出发，进入同一容器中的另一个节点
    pub(crate) fn trigger_node_from(&mut self, from: NodeInstanceId, node_id: NodeId) -> Result<()> {
        let source = self
            .trigger_source(from)
            .ok_or(ProcessError::UnknownNodeInstance(from))?;
        let container_def = self.require_container(source.container)?.definition;
        let target = self.definition.require_node(node_id)?;
        if target.container != container_def {
            return Err(ProcessError::UnknownNode(format!(
                "{} (not in {container_def})",
                target.name
            )));
        }
        self.trigger_node_with_source(&source, node_id)
    }

    fn trigger_node_with_source(&mut self, source: &TriggerSource, node_id: NodeId) -> Result<()> {
        let target = self.create_node_instance(source.container, node_id)?;
        self.trigger_node_instance(target, Some(source.clone()), connection::DEFAULT_TYPE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SelectMode {
    /// 多连接模式：只评估带约束的连接
    Priority,
    First,
    Satisfied,
}
