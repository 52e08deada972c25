use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::{ProcessError, Result};
use crate::flow::conditions::ActionFn;
use crate::flow::connections::{ConnectionDefinition, Constraint};
use crate::flow::constants::{connection, events};
use crate::flow::contexts::{
    CompensationHandler, ContextDeclarations, ExceptionHandler, VariableDeclaration,
};
use crate::flow::nodes::{
    BoundaryEventNode, EventSubProcessNode, FaultNode, JoinKind, NodeDefinition, NodeKind,
    SplitKind, StartNode, WorkItemNode,
};
use crate::flow::types::{ContainerDef, NodeId, ProcessDefinition};
use crate::utils::validation::DefinitionValidator;

struct PendingConnection {
    from: String,
    to: String,
    from_type: String,
    to_type: String,
    constraint: Option<Constraint>,
}

/// 流程构建器
///
/// 节点按名称引用，名称在整个流程内唯一；子流程内的节点通过闭包添加。
/// 连接、处理器等引用在 `build` 时统一解析。
pub struct ProcessBuilder {
    id: String,
    name: String,
    version: String,
    next_id: NodeId,
    nodes: BTreeMap<NodeId, NodeDefinition>,
    names: HashMap<String, NodeId>,
    unique_ids: HashMap<NodeId, String>,
    scope: Vec<ContainerDef>,
    connections: Vec<PendingConnection>,
    contexts: HashMap<ContainerDef, ContextDeclarations>,
    exception_handlers: Vec<(ContainerDef, String, String)>,
    compensation_handlers: Vec<(ContainerDef, String, String)>,
    errors: Vec<String>,
}

impl ProcessBuilder {
    pub fn new<I: Into<String>, N: Into<String>>(id: I, name: N) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "1.0".to_string(),
            next_id: 1,
            nodes: BTreeMap::new(),
            names: HashMap::new(),
            unique_ids: HashMap::new(),
            scope: vec![ContainerDef::Process],
            connections: Vec::new(),
            contexts: HashMap::new(),
            exception_handlers: Vec::new(),
            compensation_handlers: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn version(&mut self, version: &str) -> &mut Self {
        self.version = version.to_string();
        self
    }

    fn current(&self) -> ContainerDef {
        self.scope.last().copied().unwrap_or(ContainerDef::Process)
    }

    fn push_node(&mut self, name: &str, kind: NodeKind) -> Option<NodeId> {
        if self.names.contains_key(name) {
            self.errors.push(format!("duplicate node name `{name}`"));
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.names.insert(name.to_string(), id);
        self.nodes.insert(
            id,
            NodeDefinition {
                id,
                name: name.to_string(),
                unique_id: String::new(),
                kind,
                container: self.current(),
                hidden: false,
                for_compensation: false,
                metadata: BTreeMap::new(),
            },
        );
        Some(id)
    }

    fn add_node(&mut self, name: &str, kind: NodeKind) -> &mut Self {
        self.push_node(name, kind);
        self
    }

    fn with_node<F>(&mut self, name: &str, apply: F) -> &mut Self
    where
        F: FnOnce(&mut NodeDefinition) -> std::result::Result<(), String>,
    {
        let outcome = match self.names.get(name).and_then(|id| self.nodes.get_mut(id)) {
            Some(node) => apply(node),
            None => Err(format!("unknown node `{name}`")),
        };
        if let Err(message) = outcome {
            self.errors.push(message);
        }
        self
    }

    pub fn add_start(&mut self, name: &str) -> &mut Self {
        self.add_node(name, NodeKind::Start(StartNode::default()))
    }

    /// 事件开始节点（用于事件子流程），默认中断
    pub fn add_signal_start(&mut self, name: &str, event_type: &str) -> &mut Self {
        self.add_node(
            name,
            NodeKind::Start(StartNode {
                trigger: Some(event_type.to_string()),
                interrupting: true,
                ..StartNode::default()
            }),
        )
    }

    /// 错误开始节点，由异常作用域按故障类型触发
    pub fn add_error_start(&mut self, name: &str, fault_kind: &str) -> &mut Self {
        self.add_signal_start(name, &events::error_event(fault_kind))
    }

    /// 补偿开始节点（不中断）
    pub fn add_compensation_start(&mut self, name: &str) -> &mut Self {
        self.add_node(
            name,
            NodeKind::Start(StartNode {
                trigger: Some(events::COMPENSATION.to_string()),
                interrupting: false,
                ..StartNode::default()
            }),
        )
    }

    pub fn set_interrupting(&mut self, name: &str, interrupting: bool) -> &mut Self {
        self.with_node(name, |node| match &mut node.kind {
            NodeKind::Start(start) => {
                start.interrupting = interrupting;
                Ok(())
            }
            NodeKind::BoundaryEvent(boundary) => {
                boundary.cancel_activity = interrupting;
                Ok(())
            }
            other => Err(format!("node `{}` ({}) cannot interrupt", node.name, other.kind_name())),
        })
    }

    pub fn set_fault_code(&mut self, name: &str, fault_code: &str) -> &mut Self {
        self.with_node(name, |node| match &mut node.kind {
            NodeKind::Start(start) => {
                start.fault_code = Some(fault_code.to_string());
                Ok(())
            }
            _ => Err(format!("fault code requires a start node, `{}` is not", node.name)),
        })
    }

    /// 信号载荷写入的变量（事件开始节点或等待事件节点）
    pub fn set_event_variable(&mut self, name: &str, variable: &str) -> &mut Self {
        self.with_node(name, |node| match &mut node.kind {
            NodeKind::Start(start) => {
                start.variable = Some(variable.to_string());
                Ok(())
            }
            NodeKind::EventWait { variable: slot, .. } => {
                *slot = Some(variable.to_string());
                Ok(())
            }
            _ => Err(format!("node `{}` does not receive events", node.name)),
        })
    }

    pub fn add_end(&mut self, name: &str) -> &mut Self {
        self.add_node(name, NodeKind::End { terminate: false })
    }

    pub fn add_terminate_end(&mut self, name: &str) -> &mut Self {
        self.add_node(name, NodeKind::End { terminate: true })
    }

    pub fn add_action(&mut self, name: &str, action: ActionFn) -> &mut Self {
        self.add_node(name, NodeKind::Action(action))
    }

    pub fn add_work_item(&mut self, name: &str, work_name: &str) -> &mut Self {
        self.add_node(
            name,
            NodeKind::WorkItem(WorkItemNode {
                name: work_name.to_string(),
                ..WorkItemNode::default()
            }),
        )
    }

    fn with_work_item<F>(&mut self, name: &str, apply: F) -> &mut Self
    where
        F: FnOnce(&mut WorkItemNode),
    {
        self.with_node(name, |node| match &mut node.kind {
            NodeKind::WorkItem(work) => {
                apply(work);
                Ok(())
            }
            _ => Err(format!("node `{}` is not a work item", node.name)),
        })
    }

    pub fn set_work_item_parameter(&mut self, name: &str, key: &str, value: Value) -> &mut Self {
        self.with_work_item(name, |work| {
            work.parameters.insert(key.to_string(), value);
        })
    }

    /// 触发时把变量值作为参数传给工作项
    pub fn map_work_item_input(&mut self, name: &str, parameter: &str, variable: &str) -> &mut Self {
        self.with_work_item(name, |work| {
            work.input_mappings
                .insert(parameter.to_string(), variable.to_string());
        })
    }

    /// 完成时把结果写回变量
    pub fn map_work_item_output(&mut self, name: &str, result: &str, variable: &str) -> &mut Self {
        self.with_work_item(name, |work| {
            work.output_mappings
                .insert(result.to_string(), variable.to_string());
        })
    }

    pub fn add_split(&mut self, name: &str, kind: SplitKind) -> &mut Self {
        self.add_node(name, NodeKind::Split(kind))
    }

    pub fn add_join(&mut self, name: &str, kind: JoinKind) -> &mut Self {
        self.add_node(name, NodeKind::Join(kind))
    }

    pub fn add_event_wait(&mut self, name: &str, event_type: &str) -> &mut Self {
        self.add_node(
            name,
            NodeKind::EventWait {
                event_type: event_type.to_string(),
                variable: None,
            },
        )
    }

    pub fn add_boundary_event(
        &mut self,
        name: &str,
        attached_to: &str,
        event_type: &str,
        cancel_activity: bool,
    ) -> &mut Self {
        let Some(attached) = self.names.get(attached_to).copied() else {
            self.errors
                .push(format!("boundary `{name}` attached to unknown node `{attached_to}`"));
            return self;
        };
        self.add_node(
            name,
            NodeKind::BoundaryEvent(BoundaryEventNode {
                attached_to: attached,
                event_type: event_type.to_string(),
                cancel_activity,
            }),
        )
    }

    /// 补偿边界事件，并关联到补偿处理器节点
    pub fn add_compensation_boundary(
        &mut self,
        name: &str,
        attached_to: &str,
        handler: &str,
    ) -> &mut Self {
        self.add_boundary_event(name, attached_to, events::COMPENSATION, false);
        self.connect(name, handler)
    }

    pub fn add_sub_process<F>(&mut self, name: &str, build: F) -> &mut Self
    where
        F: FnOnce(&mut ProcessBuilder),
    {
        if let Some(id) = self.push_node(name, NodeKind::SubProcess) {
            self.scope.push(ContainerDef::Node(id));
            build(self);
            self.scope.pop();
        }
        self
    }

    pub fn add_event_sub_process<F>(&mut self, name: &str, build: F) -> &mut Self
    where
        F: FnOnce(&mut ProcessBuilder),
    {
        let kind = NodeKind::EventSubProcess(EventSubProcessNode::default());
        if let Some(id) = self.push_node(name, kind) {
            self.scope.push(ContainerDef::Node(id));
            build(self);
            self.scope.pop();
        }
        self
    }

    pub fn set_keep_active(&mut self, name: &str, keep_active: bool) -> &mut Self {
        self.with_node(name, |node| match &mut node.kind {
            NodeKind::EventSubProcess(sub) => {
                sub.keep_active = keep_active;
                Ok(())
            }
            _ => Err(format!("node `{}` is not an event sub-process", node.name)),
        })
    }

    /// 补偿抛出事件；`activity_ref` 为空时补偿所在容器
    pub fn add_compensation_throw(&mut self, name: &str, activity_ref: Option<&str>) -> &mut Self {
        self.add_node(
            name,
            NodeKind::CompensationThrow {
                activity_ref: activity_ref.map(str::to_string),
            },
        )
    }

    pub fn add_fault(&mut self, name: &str, kind: &str, message: Option<&str>) -> &mut Self {
        self.add_node(
            name,
            NodeKind::Fault(FaultNode {
                kind: kind.to_string(),
                message: message.map(str::to_string),
            }),
        )
    }

    pub fn add_custom(&mut self, name: &str, handler: &str) -> &mut Self {
        self.add_node(
            name,
            NodeKind::Custom {
                handler: handler.to_string(),
            },
        )
    }

    pub fn set_hidden(&mut self, name: &str) -> &mut Self {
        self.with_node(name, |node| {
            node.hidden = true;
            Ok(())
        })
    }

    pub fn set_for_compensation(&mut self, name: &str) -> &mut Self {
        self.with_node(name, |node| {
            node.for_compensation = true;
            Ok(())
        })
    }

    pub fn set_unique_id(&mut self, name: &str, unique_id: &str) -> &mut Self {
        match self.names.get(name) {
            Some(id) => {
                self.unique_ids.insert(*id, unique_id.to_string());
            }
            None => self.errors.push(format!("unknown node `{name}`")),
        }
        self
    }

    pub fn set_node_metadata(&mut self, name: &str, key: &str, value: Value) -> &mut Self {
        self.with_node(name, |node| {
            node.metadata.insert(key.to_string(), value);
            Ok(())
        })
    }

    pub fn connect(&mut self, from: &str, to: &str) -> &mut Self {
        self.connect_typed(
            from,
            to,
            connection::DEFAULT_TYPE,
            connection::DEFAULT_TYPE,
        )
    }

    pub fn connect_typed(
        &mut self,
        from: &str,
        to: &str,
        from_type: &str,
        to_type: &str,
    ) -> &mut Self {
        self.connections.push(PendingConnection {
            from: from.to_string(),
            to: to.to_string(),
            from_type: from_type.to_string(),
            to_type: to_type.to_string(),
            constraint: None,
        });
        self
    }

    pub fn connect_with_constraint(
        &mut self,
        from: &str,
        to: &str,
        constraint: Constraint,
    ) -> &mut Self {
        self.connections.push(PendingConnection {
            from: from.to_string(),
            to: to.to_string(),
            from_type: connection::DEFAULT_TYPE.to_string(),
            to_type: connection::DEFAULT_TYPE.to_string(),
            constraint: Some(constraint),
        });
        self
    }

    /// 在当前容器声明变量
    pub fn declare_variable(&mut self, name: &str, default: Option<Value>) -> &mut Self {
        let container = self.current();
        self.contexts
            .entry(container)
            .or_default()
            .variables_mut()
            .variables
            .push(VariableDeclaration {
                name: name.to_string(),
                default,
            });
        self
    }

    /// 在当前容器为故障类型登记处理器节点
    pub fn add_exception_handler(&mut self, fault_kind: &str, handler: &str) -> &mut Self {
        let container = self.current();
        self.exception_handlers
            .push((container, fault_kind.to_string(), handler.to_string()));
        self
    }

    /// 在当前容器为活动显式登记补偿处理器
    pub fn add_compensation_handler(&mut self, activity: &str, handler: &str) -> &mut Self {
        let container = self.current();
        self.compensation_handlers
            .push((container, activity.to_string(), handler.to_string()));
        self
    }

    fn lookup(&self, name: &str) -> Result<NodeId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| ProcessError::UnknownNode(name.to_string()))
    }

    fn default_unique_id(&self, id: NodeId) -> String {
        let mut path = id.to_string();
        let mut container = self.nodes.get(&id).map(|node| node.container);
        while let Some(ContainerDef::Node(parent)) = container {
            path = format!("{parent}:{path}");
            container = self.nodes.get(&parent).map(|node| node.container);
        }
        path
    }

    pub fn build(mut self) -> Result<ProcessDefinition> {
        if !self.errors.is_empty() {
            return Err(ProcessError::InvalidDefinition(self.errors.join("; ")));
        }

        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in &ids {
            let unique_id = self
                .unique_ids
                .get(id)
                .cloned()
                .unwrap_or_else(|| self.default_unique_id(*id));
            if let Some(node) = self.nodes.get_mut(id) {
                node.unique_id = unique_id;
            }
        }

        let mut children: HashMap<ContainerDef, Vec<NodeId>> = HashMap::new();
        for node in self.nodes.values() {
            children.entry(node.container).or_default().push(node.id);
        }

        let mut connections = Vec::with_capacity(self.connections.len());
        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for pending in std::mem::take(&mut self.connections) {
            let from = self.lookup(&pending.from)?;
            let to = self.lookup(&pending.to)?;
            let (from_node, to_node) = (&self.nodes[&from], &self.nodes[&to]);
            if from_node.container != to_node.container {
                return Err(ProcessError::InvalidDefinition(format!(
                    "connection `{}` -> `{}` crosses container boundaries",
                    pending.from, pending.to
                )));
            }
            let index = connections.len();
            connections.push(ConnectionDefinition {
                unique_id: format!("{}-{}", from_node.unique_id, to_node.unique_id),
                from,
                to,
                from_type: pending.from_type,
                to_type: pending.to_type,
                constraint: pending.constraint,
            });
            outgoing.entry(from).or_default().push(index);
            incoming.entry(to).or_default().push(index);
        }

        let mut contexts = std::mem::take(&mut self.contexts);
        self.derive_boundary_compensation(&mut contexts, &connections);
        self.derive_event_sub_process_handlers(&mut contexts, &children);

        for (container, fault_kind, handler) in std::mem::take(&mut self.exception_handlers) {
            let handler_node = self.lookup(&handler)?;
            contexts
                .entry(container)
                .or_default()
                .exception_mut()
                .handlers
                .insert(fault_kind, ExceptionHandler { handler_node });
        }

        for (container, activity, handler) in std::mem::take(&mut self.compensation_handlers) {
            let activity_id = self.lookup(&activity)?;
            let handler_id = self.lookup(&handler)?;
            let handler_node = &self.nodes[&handler_id];
            let registered = match &handler_node.kind {
                NodeKind::BoundaryEvent(boundary) => CompensationHandler::BoundaryEvent {
                    node: handler_id,
                    attached_to: boundary.attached_to,
                },
                NodeKind::EventSubProcess(_) => CompensationHandler::EventSubProcess {
                    node: handler_id,
                    parent: handler_node.container,
                },
                other => {
                    return Err(ProcessError::IllegalNodeKind {
                        node: handler_node.name.clone(),
                        kind: other.kind_name().to_string(),
                        reason: "compensation handlers must be boundary events or event sub-processes"
                            .to_string(),
                    })
                }
            };
            let key = self.nodes[&activity_id].unique_id.clone();
            contexts
                .entry(container)
                .or_default()
                .compensation_mut()
                .handlers
                .insert(key, registered);
        }

        let definition = ProcessDefinition {
            id: self.id,
            name: self.name,
            version: self.version,
            nodes: self.nodes,
            children,
            connections,
            outgoing,
            incoming,
            contexts,
        };
        DefinitionValidator::validate(&definition)?;
        Ok(definition)
    }

    /// 补偿边界事件登记到所附着活动的容器，关联目标标记为补偿处理器
    fn derive_boundary_compensation(
        &mut self,
        contexts: &mut HashMap<ContainerDef, ContextDeclarations>,
        connections: &[ConnectionDefinition],
    ) {
        let mut handler_targets = Vec::new();
        for node in self.nodes.values() {
            let NodeKind::BoundaryEvent(boundary) = &node.kind else {
                continue;
            };
            if boundary.event_type != events::COMPENSATION {
                continue;
            }
            let Some(attached) = self.nodes.get(&boundary.attached_to) else {
                continue;
            };
            contexts
                .entry(node.container)
                .or_default()
                .compensation_mut()
                .handlers
                .insert(
                    attached.unique_id.clone(),
                    CompensationHandler::BoundaryEvent {
                        node: node.id,
                        attached_to: boundary.attached_to,
                    },
                );
            handler_targets.extend(
                connections
                    .iter()
                    .filter(|conn| conn.from == node.id)
                    .map(|conn| conn.to),
            );
        }
        for target in handler_targets {
            if let Some(node) = self.nodes.get_mut(&target) {
                node.for_compensation = true;
            }
        }
    }

    /// 事件子流程的补偿开始与错误开始分别登记为补偿处理器与异常处理器
    fn derive_event_sub_process_handlers(
        &self,
        contexts: &mut HashMap<ContainerDef, ContextDeclarations>,
        children: &HashMap<ContainerDef, Vec<NodeId>>,
    ) {
        for node in self.nodes.values() {
            if !matches!(node.kind, NodeKind::EventSubProcess(_)) {
                continue;
            }
            let parent = node.container;
            let triggers = children
                .get(&ContainerDef::Node(node.id))
                .into_iter()
                .flatten()
                .filter_map(|child| match &self.nodes[child].kind {
                    NodeKind::Start(StartNode {
                        trigger: Some(trigger),
                        ..
                    }) => Some(trigger.clone()),
                    _ => None,
                });
            for trigger in triggers {
                if trigger == events::COMPENSATION {
                    let (scope, key) = match parent {
                        ContainerDef::Process => (ContainerDef::Process, self.id.clone()),
                        ContainerDef::Node(sub) => {
                            let sub_node = &self.nodes[&sub];
                            (sub_node.container, sub_node.unique_id.clone())
                        }
                    };
                    contexts
                        .entry(scope)
                        .or_default()
                        .compensation_mut()
                        .handlers
                        .insert(
                            key,
                            CompensationHandler::EventSubProcess {
                                node: node.id,
                                parent,
                            },
                        );
                } else if let Some(kind) = trigger.strip_prefix(events::ERROR_PREFIX) {
                    contexts
                        .entry(parent)
                        .or_default()
                        .exception_mut()
                        .handlers
                        .insert(
                            kind.to_string(),
                            ExceptionHandler {
                                handler_node: node.id,
                            },
                        );
                }
            }
        }
    }
}
