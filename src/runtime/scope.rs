use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::{ActionFault, ProcessError, Result};
use crate::flow::constants::{connection, events};
use crate::flow::contexts::ContextKind;
use crate::flow::nodes::NodeKind;
use crate::flow::types::{ContainerDef, NodeId};
use crate::runtime::container::{ContainerKey, ContainerKind};
use crate::runtime::node_instance::NodeInstanceId;
use crate::runtime::process_instance::{ProcessInstance, ProcessInstanceId};
use crate::state::{HandledFault, VariableScopeInstance};

/// 上下文解析的起点：静态节点及其所在的运行时容器
///
/// 节点实例离开后仍可用于条件求值。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ContextAnchor {
    pub node_id: NodeId,
    pub container: ContainerKey,
}

impl ContextAnchor {
    pub(crate) fn new(node_id: NodeId, container: ContainerKey) -> Self {
        Self { node_id, container }
    }
}

/// 节点动作与插件看到的执行上下文
pub struct NodeContext<'a> {
    process: &'a mut ProcessInstance,
    anchor: ContextAnchor,
    node_instance: NodeInstanceId,
    node_name: String,
    level: u32,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(process: &'a mut ProcessInstance, node_instance: NodeInstanceId) -> Result<Self> {
        let instance = process
            .node_instances
            .get(&node_instance)
            .ok_or(ProcessError::UnknownNodeInstance(node_instance))?;
        let anchor = ContextAnchor::new(instance.node_id, instance.container);
        let level = instance.level;
        let node_name = process.definition.require_node(instance.node_id)?.name.clone();
        Ok(Self {
            process,
            anchor,
            node_instance,
            node_name,
            level,
        })
    }

    pub fn process_instance_id(&self) -> ProcessInstanceId {
        self.process.id
    }

    pub fn process_id(&self) -> &str {
        &self.process.definition.id
    }

    pub fn node_instance_id(&self) -> NodeInstanceId {
        self.node_instance
    }

    pub fn node_instance_unique_id(&self) -> Option<String> {
        self.process.node_instance_unique_id(self.node_instance)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// 按作用域读取变量，未声明时读流程级变量
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.process.read_variable(&self.anchor, name)
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) {
        self.process.write_variable(&self.anchor, name, value.into());
    }
}

/// 连接约束求值时的只读上下文
pub struct ConditionContext<'a> {
    process: &'a ProcessInstance,
    anchor: ContextAnchor,
}

impl<'a> ConditionContext<'a> {
    pub(crate) fn new(process: &'a ProcessInstance, anchor: ContextAnchor) -> Self {
        Self { process, anchor }
    }

    pub fn process_instance_id(&self) -> ProcessInstanceId {
        self.process.id
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.process.read_variable(&self.anchor, name)
    }
}

impl ProcessInstance {
    /// 沿运行时容器链向外，找到托管 `def` 的活动容器
    ///
    /// 补偿容器只是处理器的执行场所，不参与上下文解析。
    pub(crate) fn live_container_for(&self, start: ContainerKey, def: ContainerDef) -> Option<ContainerKey> {
        let mut current = Some(start);
        while let Some(key) = current {
            if let Some(container) = self.containers.get(&key) {
                if container.kind != ContainerKind::Compensation && container.definition == def {
                    return Some(key);
                }
            }
            current = self.parent_container(key);
        }
        None
    }

    /// 为 `key` 解析 `kind` 上下文所在的活动容器
    pub(crate) fn resolve_context_container(
        &self,
        anchor: &ContextAnchor,
        kind: ContextKind,
        key: &str,
    ) -> Option<(ContainerDef, ContainerKey)> {
        let def = self.definition.resolve_context(anchor.node_id, kind, key)?;
        let container = self.live_container_for(anchor.container, def)?;
        Some((def, container))
    }

    pub(crate) fn process_variables(&mut self) -> Result<&mut VariableScopeInstance> {
        let definition = Arc::clone(&self.definition);
        let declared = definition
            .contexts(ContainerDef::Process)
            .and_then(|decls| decls.variables.as_ref());
        Ok(self
            .container_mut(ContainerKey::Process)?
            .contexts_mut()
            .variables_or_init(declared))
    }

    pub(crate) fn read_variable(&self, anchor: &ContextAnchor, name: &str) -> Option<Value> {
        let (def, key) = self
            .resolve_context_container(anchor, ContextKind::Variable, name)
            .unwrap_or((ContainerDef::Process, ContainerKey::Process));
        let container = self.containers.get(&key)?;
        match container.contexts().variables() {
            Some(vars) => vars.get(name).cloned(),
            None => self
                .definition
                .contexts(def)
                .and_then(|decls| decls.variables.as_ref())
                .and_then(|scope| scope.find(name))
                .and_then(|decl| decl.default.clone()),
        }
    }

    pub(crate) fn write_variable(&mut self, anchor: &ContextAnchor, name: &str, value: Value) {
        let (def, key) = match self.resolve_context_container(anchor, ContextKind::Variable, name) {
            Some(resolved) => resolved,
            None => {
                error!(variable = name, "could not find variable, using process-level scope");
                (ContainerDef::Process, ContainerKey::Process)
            }
        };
        let definition = Arc::clone(&self.definition);
        let declared = definition
            .contexts(def)
            .and_then(|decls| decls.variables.as_ref());
        if let Some(container) = self.containers.get_mut(&key) {
            container
                .contexts_mut()
                .variables_or_init(declared)
                .set(name, value);
        }
    }

    /// 处理节点动作抛出的故障
    ///
    /// 找到异常作用域时取消出错实例，控制转入处理器；否则返回致命故障。
    pub(crate) fn handle_action_fault(&mut self, id: NodeInstanceId, fault: ActionFault) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let instance = self
            .node_instances
            .get(&id)
            .ok_or(ProcessError::UnknownNodeInstance(id))?;
        let anchor = ContextAnchor::new(instance.node_id, instance.container);

        let Some((def, scope_container)) =
            self.resolve_context_container(&anchor, ContextKind::Exception, &fault.kind)
        else {
            warn!(
                process_instance = self.id,
                node_instance = id,
                fault = %fault,
                "unhandled action fault"
            );
            return Err(ProcessError::runtime(
                Some(id),
                self.id,
                format!("Unable to execute Action: {}", fault.message),
                Some(anyhow::Error::new(fault)),
            ));
        };
        let handler_node = definition
            .contexts(def)
            .and_then(|decls| decls.exception.as_ref())
            .and_then(|scope| scope.handlers.get(&fault.kind))
            .map(|handler| handler.handler_node)
            .ok_or_else(|| ProcessError::Context(format!("exception handler for `{}` vanished", fault.kind)))?;

        debug!(
            process_instance = self.id,
            node_instance = id,
            kind = %fault.kind,
            handler_node,
            "redirecting action fault to exception handler"
        );
        self.container_mut(scope_container)?
            .contexts_mut()
            .exception_or_init()
            .record(HandledFault {
                kind: fault.kind.clone(),
                message: fault.message.clone(),
                node_instance: id,
                handler_node,
            });
        self.cancel_node_instance(id)?;

        self.run_isolated(|pi| pi.enter_exception_handler(handler_node, scope_container, &fault))
    }

    fn enter_exception_handler(
        &mut self,
        handler_node: NodeId,
        container: ContainerKey,
        fault: &ActionFault,
    ) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let node = definition.require_node(handler_node)?;
        match node.kind {
            NodeKind::EventSubProcess(_) => {
                self.start_event_sub_process(
                    handler_node,
                    container,
                    &events::error_event(&fault.kind),
                    Value::String(fault.message.clone()),
                )?;
                Ok(())
            }
            _ => {
                let handler = self.create_node_instance(container, handler_node)?;
                self.trigger_node_instance(handler, None, connection::DEFAULT_TYPE)
            }
        }
    }
}
