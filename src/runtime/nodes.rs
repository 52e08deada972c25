use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ActionFault, ProcessError, Result};
use crate::flow::conditions::ActionFn;
use crate::flow::constants::{connection, events};
use crate::flow::contexts::ContextKind;
use crate::flow::nodes::{FaultNode, JoinKind, NodeKind, SplitKind, WorkItemNode};
use crate::flow::types::{ContainerDef, NodeId};
use crate::runtime::container::ContainerKey;
use crate::runtime::handlers::NodeOutcome;
use crate::runtime::node_instance::{NodeInstanceId, NodeInstanceState, TriggerSource};
use crate::runtime::process_instance::{ProcessInstance, ProcessState};
use crate::runtime::protocol::Route;
use crate::runtime::scope::{ContextAnchor, NodeContext};
use crate::runtime::work::{WorkItem, WorkItemOutcome, WorkItemState};

impl ProcessInstance {
    /// 节点类型相关的进入逻辑
    pub(crate) fn enter_node(
        &mut self,
        id: NodeInstanceId,
        from: Option<&TriggerSource>,
        conn_type: &str,
    ) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let node_id = self
            .node_instances
            .get(&id)
            .map(|instance| instance.node_id)
            .ok_or(ProcessError::UnknownNodeInstance(id))?;
        let node = definition.require_node(node_id)?;

        match &node.kind {
            NodeKind::Start(_) | NodeKind::BoundaryEvent(_) => {
                self.trigger_completed(id, connection::DEFAULT_TYPE, true)
            }
            NodeKind::End { terminate } => self.enter_end(id, *terminate),
            NodeKind::Action(action) => self.enter_action(id, action),
            NodeKind::WorkItem(work) => self.enter_work_item(id, work),
            NodeKind::Split(kind) => self.enter_split(id, *kind),
            NodeKind::Join(kind) => self.enter_join(id, from, conn_type, *kind),
            // 等待 signal_event
            NodeKind::EventWait { .. } => Ok(()),
            NodeKind::SubProcess => self.enter_sub_process(id, node_id),
            // 事件子流程只由事件启动
            NodeKind::EventSubProcess(_) => Ok(()),
            NodeKind::CompensationThrow { activity_ref } => {
                let target = match activity_ref {
                    Some(activity_ref) => activity_ref.clone(),
                    None => {
                        let container_id = definition
                            .container_unique_id(node.container)
                            .ok_or_else(|| ProcessError::UnknownContainer(node.container.to_string()))?;
                        events::implicit_compensation(container_id)
                    }
                };
                self.signal_compensation(&Value::String(target))?;
                self.trigger_completed(id, connection::DEFAULT_TYPE, true)
            }
            NodeKind::Fault(fault) => self.enter_fault(id, fault),
            NodeKind::Custom { handler } => self.enter_custom(id, handler),
        }
    }

    fn enter_end(&mut self, id: NodeInstanceId, terminate: bool) -> Result<()> {
        let Some(instance) = self.node_instances.get(&id) else {
            return Ok(());
        };
        let container = instance.container;
        let event = if instance.metadata.hidden {
            None
        } else {
            self.node_event(id)
        };
        if let Some(event) = &event {
            self.fire(|listener| listener.before_node_left(event));
        }
        self.detach(id)?;
        self.end_reached(container, terminate)?;
        if let Some(event) = &event {
            self.fire(|listener| listener.after_node_left(event));
        }
        Ok(())
    }

    fn enter_action(&mut self, id: NodeInstanceId, action: &ActionFn) -> Result<()> {
        let outcome = {
            let mut ctx = NodeContext::new(self, id)?;
            action(&mut ctx)
        };
        match outcome {
            Ok(()) => self.trigger_completed(id, connection::DEFAULT_TYPE, true),
            Err(fault) => self.handle_action_fault(id, fault),
        }
    }

    fn enter_split(&mut self, id: NodeInstanceId, kind: SplitKind) -> Result<()> {
        let route = match kind {
            SplitKind::And => Route::Type(connection::DEFAULT_TYPE),
            SplitKind::Xor => Route::First,
            SplitKind::Or => Route::Satisfied,
            SplitKind::EventBased => Route::Exclusive,
        };
        self.leave(id, true, route)
    }

    /// 汇聚网关
    ///
    /// 与门按来源节点计数，每个来源至少到达一次后放行并各扣减一次。
    fn enter_join(
        &mut self,
        id: NodeInstanceId,
        from: Option<&TriggerSource>,
        conn_type: &str,
        kind: JoinKind,
    ) -> Result<()> {
        if kind == JoinKind::Xor {
            return self.trigger_completed(id, connection::DEFAULT_TYPE, true);
        }

        let definition = Arc::clone(&self.definition);
        let Some(instance) = self.node_instances.get_mut(&id) else {
            return Ok(());
        };
        let mut required: Vec<_> = definition
            .incoming_connections(instance.node_id, conn_type)
            .map(|conn| conn.from)
            .collect();
        required.sort_unstable();
        required.dedup();

        let NodeInstanceState::Join { arrivals } = &mut instance.state else {
            return Err(ProcessError::Context(format!("node instance {id} has no join state")));
        };
        if let Some(source) = from {
            *arrivals.entry(source.node_id).or_insert(0) += 1;
        }
        let ready = required
            .iter()
            .all(|node| arrivals.get(node).is_some_and(|count| *count > 0));
        if !ready {
            debug!(node_instance = id, arrivals = ?arrivals, "join waiting");
            return Ok(());
        }
        for node in &required {
            if let Some(count) = arrivals.get_mut(node) {
                *count -= 1;
            }
        }
        arrivals.retain(|_, count| *count > 0);
        let remove = arrivals.is_empty();
        self.trigger_completed(id, connection::DEFAULT_TYPE, remove)
    }

    fn enter_sub_process(&mut self, id: NodeInstanceId, node_id: NodeId) -> Result<()> {
        let starts = self.definition.start_nodes(ContainerDef::Node(node_id));
        if starts.is_empty() {
            return self.trigger_completed(id, connection::DEFAULT_TYPE, true);
        }
        let container = ContainerKey::Node(id);
        for start in starts {
            if !self.is_container_active(container) {
                break;
            }
            let child = self.create_node_instance(container, start)?;
            self.run_isolated(|pi| pi.trigger_node_instance(child, None, connection::DEFAULT_TYPE))?;
        }
        Ok(())
    }

    /// 故障结束节点：有异常作用域时转入处理器，否则中止流程
    fn enter_fault(&mut self, id: NodeInstanceId, fault: &FaultNode) -> Result<()> {
        let action_fault = ActionFault::new(
            fault.kind.clone(),
            fault.message.clone().unwrap_or_else(|| fault.kind.clone()),
        );
        let handled = self.node_instances.get(&id).is_some_and(|instance| {
            let anchor = ContextAnchor::new(instance.node_id, instance.container);
            self.resolve_context_container(&anchor, ContextKind::Exception, &fault.kind)
                .is_some()
        });
        if handled {
            return self.handle_action_fault(id, action_fault);
        }
        warn!(
            process_instance = self.id,
            node_instance = id,
            kind = %fault.kind,
            "unhandled fault, aborting process instance"
        );
        self.detach(id)?;
        self.terminate(ProcessState::Aborted, Some(fault.kind.clone()))
    }

    fn enter_custom(&mut self, id: NodeInstanceId, handler_name: &str) -> Result<()> {
        let environment = Arc::clone(&self.environment);
        let handler = environment
            .node_handler(handler_name)
            .ok_or_else(|| ProcessError::NodeHandlerNotRegistered(handler_name.to_string()))?;
        let outcome = {
            let mut ctx = NodeContext::new(self, id)?;
            handler.enter(&mut ctx)
        };
        match outcome {
            Ok(NodeOutcome::Complete) => self.trigger_completed(id, connection::DEFAULT_TYPE, true),
            Ok(NodeOutcome::Wait) => {
                debug!(node_instance = id, handler = handler_name, "custom node waiting");
                Ok(())
            }
            Err(err) => match err.downcast::<ActionFault>() {
                Ok(fault) => self.handle_action_fault(id, fault),
                Err(err) => Err(ProcessError::Other(err)),
            },
        }
    }

    /// 派发工作项
    ///
    /// 处理器可同步完成或放弃；未注册处理器时工作项保持挂起，等待外部回调。
    fn enter_work_item(&mut self, id: NodeInstanceId, work: &WorkItemNode) -> Result<()> {
        let anchor = self
            .node_instances
            .get(&id)
            .map(|instance| ContextAnchor::new(instance.node_id, instance.container))
            .ok_or(ProcessError::UnknownNodeInstance(id))?;

        let mut parameters: BTreeMap<String, Value> = work.parameters.clone();
        for (parameter, variable) in &work.input_mappings {
            if let Some(value) = self.read_variable(&anchor, variable) {
                parameters.insert(parameter.clone(), value);
            }
        }
        let item_id = self.allocate_work_item_id();
        let item = WorkItem {
            id: item_id,
            name: work.name.clone(),
            process_instance: self.id,
            node_instance: id,
            parameters,
            state: WorkItemState::Pending,
        };
        if let Some(instance) = self.node_instances.get_mut(&id) {
            instance.state = NodeInstanceState::WorkItem {
                work_item_id: item_id,
            };
        }
        self.work_items.insert(item_id, item.clone());

        let Some(handler) = self.environment.work_item_handler(&work.name) else {
            warn!(
                process_instance = self.id,
                work_item = item_id,
                name = %work.name,
                "no work item handler registered, work item stays pending"
            );
            return Ok(());
        };
        debug!(work_item = item_id, name = %work.name, "dispatching work item");
        match handler.execute(&item) {
            Ok(WorkItemOutcome::Pending) => Ok(()),
            Ok(WorkItemOutcome::Completed(results)) => self.finish_work_item(item_id, results),
            Ok(WorkItemOutcome::Aborted) => self.drop_work_item(item_id),
            Err(err) => match err.downcast::<ActionFault>() {
                Ok(fault) => {
                    self.work_items.remove(&item_id);
                    self.handle_action_fault(id, fault)
                }
                Err(err) => Err(ProcessError::runtime(
                    Some(id),
                    self.id,
                    format!("Unable to execute work item `{}`: {err}", work.name),
                    Some(err),
                )),
            },
        }
    }

    /// 工作项完成：写回输出映射并离开节点
    pub(crate) fn finish_work_item(&mut self, item_id: u64, results: BTreeMap<String, Value>) -> Result<()> {
        let item = self
            .work_items
            .remove(&item_id)
            .ok_or(ProcessError::UnknownWorkItem(item_id))?;
        let Some(instance) = self.node_instances.get(&item.node_instance) else {
            return Ok(());
        };
        let anchor = ContextAnchor::new(instance.node_id, instance.container);
        let definition = Arc::clone(&self.definition);
        if let Some(NodeKind::WorkItem(work)) = definition.node(anchor.node_id).map(|node| &node.kind) {
            for (result, variable) in &work.output_mappings {
                if let Some(value) = results.get(result) {
                    self.write_variable(&anchor, variable, value.clone());
                }
            }
        }
        debug!(work_item = item_id, node_instance = item.node_instance, "work item completed");
        self.trigger_completed(item.node_instance, connection::DEFAULT_TYPE, true)
    }

    /// 工作项被放弃：节点照常离开
    pub(crate) fn drop_work_item(&mut self, item_id: u64) -> Result<()> {
        let item = self
            .work_items
            .remove(&item_id)
            .ok_or(ProcessError::UnknownWorkItem(item_id))?;
        debug!(work_item = item_id, node_instance = item.node_instance, "work item aborted by handler");
        self.trigger_completed(item.node_instance, connection::DEFAULT_TYPE, true)
    }
}
