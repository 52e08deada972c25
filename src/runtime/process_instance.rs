use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ExecutionStrategy};
use crate::error::{ProcessError, Result};
use crate::flow::constants::connection;
use crate::flow::nodes::NodeKind;
use crate::flow::types::{ContainerDef, NodeId, ProcessDefinition};
use crate::runtime::container::{ContainerKey, ContainerKind, ContainerState, NodeInstanceContainer};
use crate::runtime::environment::ProcessEnvironment;
use crate::runtime::events::{NodeEvent, ProcessEvent, ProcessEventListener};
use crate::runtime::node_instance::{NodeInstance, NodeInstanceId, NodeInstanceState, TriggerSource};
use crate::runtime::queue::QueuedAction;
use crate::runtime::work::WorkItem;
use crate::state::CompensationRecord;

/// 流程实例 ID
pub type ProcessInstanceId = u64;

/// 流程实例状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Pending,
    Active,
    Completed,
    Aborted,
    Suspended,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Aborted)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Pending => "pending",
            ProcessState::Active => "active",
            ProcessState::Completed => "completed",
            ProcessState::Aborted => "aborted",
            ProcessState::Suspended => "suspended",
        };
        f.write_str(name)
    }
}

/// 致命故障记录
///
/// 流程实例保持非终止状态，调用方据此判断实例已出错。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub node_instance: Option<NodeInstanceId>,
    pub message: String,
}

/// 流程实例
///
/// 顶层容器：持有所有节点实例、容器、完成日志与执行队列栈。
/// 所有变更都经由 `&mut self`，外部以会话锁保证单线程访问。
pub struct ProcessInstance {
    pub(crate) id: ProcessInstanceId,
    pub(crate) definition: Arc<ProcessDefinition>,
    pub(crate) environment: Arc<ProcessEnvironment>,
    pub(crate) config: EngineConfig,
    pub(crate) state: ProcessState,
    pub(crate) outcome: Option<String>,
    pub(crate) fault: Option<FaultRecord>,
    pub(crate) next_node_instance_id: NodeInstanceId,
    pub(crate) next_work_item_id: u64,
    pub(crate) completed: Vec<String>,
    pub(crate) node_instances: BTreeMap<NodeInstanceId, NodeInstance>,
    pub(crate) containers: HashMap<ContainerKey, NodeInstanceContainer>,
    pub(crate) execution_queues: Vec<Vec<QueuedAction>>,
    pub(crate) work_items: BTreeMap<u64, WorkItem>,
}

impl ProcessInstance {
    pub fn new(
        id: ProcessInstanceId,
        definition: Arc<ProcessDefinition>,
        environment: Arc<ProcessEnvironment>,
        config: EngineConfig,
    ) -> Self {
        let mut containers = HashMap::new();
        containers.insert(
            ContainerKey::Process,
            NodeInstanceContainer::new(
                ContainerKey::Process,
                ContainerKind::Process,
                ContainerDef::Process,
            ),
        );
        Self {
            id,
            definition,
            environment,
            config,
            state: ProcessState::Pending,
            outcome: None,
            fault: None,
            next_node_instance_id: 0,
            next_work_item_id: 0,
            completed: Vec::new(),
            node_instances: BTreeMap::new(),
            containers,
            execution_queues: Vec::new(),
            work_items: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ProcessInstanceId {
        self.id
    }

    pub fn process_id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.config.strategy
    }

    pub(crate) fn is_queue_based(&self) -> bool {
        self.config.strategy.is_queue_based()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ProcessState::Active
    }

    pub fn outcome(&self) -> Option<&str> {
        self.outcome.as_deref()
    }

    pub fn fault(&self) -> Option<&FaultRecord> {
        self.fault.as_ref()
    }

    /// 已完成节点的唯一 ID，按完成顺序
    pub fn completed_node_ids(&self) -> &[String] {
        &self.completed
    }

    pub fn node_instance(&self, id: NodeInstanceId) -> Option<&NodeInstance> {
        self.node_instances.get(&id)
    }

    /// 所有活动节点实例（含嵌套容器），按 ID 排序
    pub fn node_instances(&self) -> impl Iterator<Item = &NodeInstance> {
        self.node_instances.values()
    }

    /// 指定节点名称的活动实例
    pub fn node_instances_by_name(&self, name: &str) -> Vec<NodeInstanceId> {
        let Some(node) = self.definition.node_by_name(name) else {
            return Vec::new();
        };
        self.node_instances_of(node.id)
    }

    pub(crate) fn node_instances_of(&self, node_id: NodeId) -> Vec<NodeInstanceId> {
        self.node_instances
            .values()
            .filter(|instance| instance.node_id == node_id)
            .map(|instance| instance.id)
            .collect()
    }

    /// 节点实例的唯一路径：外层复合实例 ID 与自身 ID 以冒号相连
    pub fn node_instance_unique_id(&self, id: NodeInstanceId) -> Option<String> {
        let instance = self.node_instances.get(&id)?;
        let unique_id = instance.unique_id.get_or_init(|| match instance.container {
            ContainerKey::Node(parent) => match self.node_instance_unique_id(parent) {
                Some(prefix) => format!("{prefix}:{id}"),
                None => id.to_string(),
            },
            _ => id.to_string(),
        });
        Some(unique_id.clone())
    }

    pub fn container(&self, key: ContainerKey) -> Option<&NodeInstanceContainer> {
        self.containers.get(&key)
    }

    pub(crate) fn require_container(&self, key: ContainerKey) -> Result<&NodeInstanceContainer> {
        self.containers
            .get(&key)
            .ok_or_else(|| ProcessError::UnknownContainer(key.to_string()))
    }

    pub(crate) fn container_mut(&mut self, key: ContainerKey) -> Result<&mut NodeInstanceContainer> {
        self.containers
            .get_mut(&key)
            .ok_or_else(|| ProcessError::UnknownContainer(key.to_string()))
    }

    /// 流程容器的当前层级
    pub fn current_level(&self) -> u32 {
        self.containers
            .get(&ContainerKey::Process)
            .map_or(0, NodeInstanceContainer::current_level)
    }

    pub fn work_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.work_items.values()
    }

    pub fn work_item(&self, id: u64) -> Option<&WorkItem> {
        self.work_items.get(&id)
    }

    /// 某个静态容器补偿作用域的调用记录
    pub fn compensation_records(&self, scope: ContainerDef) -> &[CompensationRecord] {
        self.containers
            .get(&ContainerKey::Compensation(scope))
            .and_then(|container| container.contexts().compensation())
            .map_or(&[], |instance| instance.records())
    }

    /// 读取流程级变量
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.containers
            .get(&ContainerKey::Process)
            .and_then(|container| container.contexts().variables())
            .and_then(|vars| vars.get(name))
            .cloned()
    }

    /// 写入流程级变量
    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<()> {
        self.process_variables()?.set(name, value);
        Ok(())
    }

    pub(crate) fn is_live(&self, id: NodeInstanceId) -> bool {
        self.node_instances.contains_key(&id)
    }

    /// 容器及其所有外层都处于活动状态
    pub(crate) fn is_container_active(&self, key: ContainerKey) -> bool {
        if self.state != ProcessState::Active {
            return false;
        }
        match key {
            ContainerKey::Process | ContainerKey::Compensation(_) => true,
            ContainerKey::Node(owner) => {
                let container_active = self
                    .containers
                    .get(&key)
                    .is_some_and(|container| container.state == ContainerState::Active);
                container_active
                    && self
                        .node_instances
                        .get(&owner)
                        .is_some_and(|instance| self.is_container_active(instance.container))
            }
        }
    }

    /// 容器在运行时的外层容器
    pub(crate) fn parent_container(&self, key: ContainerKey) -> Option<ContainerKey> {
        match key {
            ContainerKey::Process => None,
            ContainerKey::Compensation(_) => Some(ContainerKey::Process),
            ContainerKey::Node(owner) => self.node_instances.get(&owner).map(|instance| instance.container),
        }
    }

    pub(crate) fn allocate_node_instance_id(&mut self) -> NodeInstanceId {
        self.next_node_instance_id += 1;
        self.next_node_instance_id
    }

    pub(crate) fn allocate_work_item_id(&mut self) -> u64 {
        self.next_work_item_id += 1;
        self.next_work_item_id
    }

    pub(crate) fn require_active(&self) -> Result<()> {
        if self.state == ProcessState::Active {
            Ok(())
        } else {
            Err(ProcessError::InvalidState {
                id: self.id,
                state: self.state,
            })
        }
    }

    pub(crate) fn node_event(&self, id: NodeInstanceId) -> Option<NodeEvent> {
        let instance = self.node_instances.get(&id)?;
        let node = self.definition.node(instance.node_id)?;
        Some(NodeEvent {
            process_instance: self.id,
            node_instance: id,
            node_instance_unique_id: self.node_instance_unique_id(id)?,
            node_id: node.id,
            node_name: node.name.clone(),
            node_unique_id: node.unique_id.clone(),
        })
    }

    pub(crate) fn fire<F>(&self, notify: F)
    where
        F: Fn(&dyn ProcessEventListener),
    {
        for listener in self.environment.listeners() {
            notify(listener.as_ref());
        }
    }

    fn process_event(&self) -> ProcessEvent {
        ProcessEvent {
            process_instance: self.id,
            process_id: self.definition.id.clone(),
            state: self.state,
            outcome: self.outcome.clone(),
        }
    }

    /// 在独立执行单元中运行；失败时记录故障
    pub(crate) fn guarded<R, F>(&mut self, operation: F) -> Result<R>
    where
        F: FnOnce(&mut Self) -> Result<R>,
    {
        let result = self.run_isolated(operation);
        if let Err(err) = &result {
            let node_instance = err.as_runtime().and_then(|runtime| runtime.node_instance);
            warn!(
                process_instance = self.id,
                node_instance = ?node_instance,
                error = %err,
                "process instance faulted"
            );
            self.fault = Some(FaultRecord {
                node_instance,
                message: err.to_string(),
            });
        }
        result
    }

    /// 启动流程实例
    ///
    /// `parameters` 写入流程级变量，随后触发流程容器中的所有普通开始节点。
    pub fn start(&mut self, parameters: BTreeMap<String, Value>) -> Result<()> {
        if self.state != ProcessState::Pending {
            return Err(ProcessError::InvalidState {
                id: self.id,
                state: self.state,
            });
        }
        self.state = ProcessState::Active;
        {
            let vars = self.process_variables()?;
            for (name, value) in parameters {
                vars.set(name, value);
            }
        }
        info!(
            process_instance = self.id,
            process_id = %self.definition.id,
            strategy = ?self.config.strategy,
            "process instance started"
        );
        let event = self.process_event();
        self.fire(|listener| listener.after_process_started(&event));

        let definition = Arc::clone(&self.definition);
        self.guarded(|pi| {
            for start in definition.start_nodes(ContainerDef::Process) {
                if !pi.is_active() {
                    break;
                }
                let id = pi.create_node_instance(ContainerKey::Process, start)?;
                pi.run_isolated(|pi| pi.trigger_node_instance(id, None, connection::DEFAULT_TYPE))?;
            }
            Ok(())
        })
    }

    /// 向流程实例发送事件
    ///
    /// `"Compensation"` 类型的载荷必须是活动唯一 ID 或 `implicit:<容器唯一 ID>`。
    pub fn signal_event(&mut self, event_type: &str, payload: Value) -> Result<()> {
        self.require_active()?;
        debug!(process_instance = self.id, event_type, "signal event");
        self.guarded(|pi| pi.dispatch_signal(event_type, &payload))
    }

    /// 向指定节点实例发送事件
    pub fn signal_event_to(
        &mut self,
        node_instance: NodeInstanceId,
        event_type: &str,
        payload: Value,
    ) -> Result<()> {
        self.require_active()?;
        if !self.is_live(node_instance) {
            return Err(ProcessError::UnknownNodeInstance(node_instance));
        }
        self.guarded(|pi| pi.signal_node_instance(node_instance, event_type, &payload))
    }

    /// 外部服务完成工作项
    pub fn complete_work_item(&mut self, id: u64, results: BTreeMap<String, Value>) -> Result<()> {
        self.require_active()?;
        if !self.work_items.contains_key(&id) {
            return Err(ProcessError::UnknownWorkItem(id));
        }
        self.guarded(|pi| pi.finish_work_item(id, results))
    }

    /// 外部服务放弃工作项；节点实例照常离开
    pub fn abort_work_item(&mut self, id: u64) -> Result<()> {
        self.require_active()?;
        if !self.work_items.contains_key(&id) {
            return Err(ProcessError::UnknownWorkItem(id));
        }
        self.guarded(|pi| pi.drop_work_item(id))
    }

    /// 放行处于等待状态的节点实例；已移除的实例静默忽略
    pub fn complete_node_instance(&mut self, id: NodeInstanceId) -> Result<()> {
        self.require_active()?;
        self.guarded(|pi| pi.trigger_completed(id, connection::DEFAULT_TYPE, true))
    }

    /// 重新进入节点实例所在的节点
    pub fn retrigger_node_instance(&mut self, id: NodeInstanceId, remove: bool) -> Result<()> {
        self.require_active()?;
        if !self.is_live(id) {
            return Err(ProcessError::UnknownNodeInstance(id));
        }
        self.guarded(|pi| pi.retrigger(id, remove))
    }

    /// 从节点实例直接触发同一容器中的另一个节点
    pub fn trigger_node(&mut self, from: NodeInstanceId, node_id: NodeId) -> Result<()> {
        self.require_active()?;
        if !self.is_live(from) {
            return Err(ProcessError::UnknownNodeInstance(from));
        }
        self.guarded(|pi| pi.trigger_node_from(from, node_id))
    }

    /// 执行故障后遗留在队列中的动作
    pub fn execute_pending(&mut self) -> Result<()> {
        self.require_active()?;
        self.guarded(|pi| pi.drain_all())
    }

    /// 中止流程实例
    pub fn abort(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ProcessError::InvalidState {
                id: self.id,
                state: self.state,
            });
        }
        self.terminate(ProcessState::Aborted, None)
    }

    pub fn suspend(&mut self) -> Result<()> {
        self.require_active()?;
        self.state = ProcessState::Suspended;
        debug!(process_instance = self.id, "process instance suspended");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != ProcessState::Suspended {
            return Err(ProcessError::InvalidState {
                id: self.id,
                state: self.state,
            });
        }
        self.state = ProcessState::Active;
        debug!(process_instance = self.id, "process instance resumed");
        Ok(())
    }

    /// 结束流程：切换状态并取消所有剩余节点实例
    pub(crate) fn terminate(&mut self, state: ProcessState, outcome: Option<String>) -> Result<()> {
        self.state = state;
        if outcome.is_some() {
            self.outcome = outcome;
        }
        let remaining = self.require_container(ContainerKey::Process)?.node_instances().to_vec();
        for id in remaining {
            self.cancel_node_instance(id)?;
        }
        // 补偿处理器实例不随流程容器结束，需单独取消
        let compensation: Vec<ContainerKey> = self
            .containers
            .keys()
            .filter(|key| matches!(key, ContainerKey::Compensation(_)))
            .copied()
            .collect();
        for key in &compensation {
            let live = self.require_container(*key)?.node_instances().to_vec();
            for id in live {
                self.cancel_node_instance(id)?;
            }
        }
        self.execution_queues.clear();
        let finished = match state {
            ProcessState::Aborted => ContainerState::Aborted,
            _ => ContainerState::Completed,
        };
        for key in compensation.into_iter().chain([ContainerKey::Process]) {
            if let Some(container) = self.containers.get_mut(&key) {
                container.state = finished;
            }
        }
        info!(
            process_instance = self.id,
            state = %self.state,
            outcome = ?self.outcome,
            "process instance finished"
        );
        let event = self.process_event();
        self.fire(|listener| listener.after_process_completed(&event));
        Ok(())
    }

    /// 新建实例时的类型相关初始状态
    pub(crate) fn initial_state(kind: &NodeKind) -> NodeInstanceState {
        match kind {
            NodeKind::Join(_) => NodeInstanceState::Join {
                arrivals: BTreeMap::new(),
            },
            NodeKind::EventSubProcess(_) => NodeInstanceState::EventSubProcess { start: None },
            _ => NodeInstanceState::None,
        }
    }

    pub(crate) fn trigger_source(&self, id: NodeInstanceId) -> Option<TriggerSource> {
        self.node_instances.get(&id).map(TriggerSource::of)
    }
}

impl fmt::Debug for ProcessInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInstance")
            .field("id", &self.id)
            .field("process_id", &self.definition.id)
            .field("strategy", &self.config.strategy)
            .field("state", &self.state)
            .field("outcome", &self.outcome)
            .field("fault", &self.fault)
            .field("live", &self.node_instances.keys().collect::<Vec<_>>())
            .field("completed", &self.completed)
            .finish()
    }
}
