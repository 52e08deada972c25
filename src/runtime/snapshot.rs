use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{ProcessError, Result};
use crate::flow::types::{ContainerDef, ProcessDefinition};
use crate::runtime::container::{ContainerKey, NodeInstanceContainer};
use crate::runtime::environment::ProcessEnvironment;
use crate::runtime::node_instance::{NodeInstance, NodeInstanceId};
use crate::runtime::process_instance::{FaultRecord, ProcessInstance, ProcessInstanceId, ProcessState};
use crate::runtime::queue::QueuedAction;
use crate::runtime::work::WorkItem;

const SNAPSHOT_VERSION: u32 = 1;

/// 流程实例快照
///
/// 包含恢复执行所需的全部运行时状态：计数器、执行队列、完成日志、
/// 各容器的层级与上下文、活动节点实例与挂起的工作项。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstanceSnapshot {
    pub version: u32,
    pub id: ProcessInstanceId,
    pub process_id: String,
    pub process_version: String,
    pub config: EngineConfig,
    pub state: ProcessState,
    pub outcome: Option<String>,
    pub fault: Option<FaultRecord>,
    pub next_node_instance_id: NodeInstanceId,
    pub next_work_item_id: u64,
    pub completed: Vec<String>,
    pub node_instances: Vec<NodeInstance>,
    pub containers: Vec<NodeInstanceContainer>,
    pub execution_queues: Vec<Vec<QueuedAction>>,
    pub work_items: Vec<WorkItem>,
}

impl ProcessInstanceSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| ProcessError::Context(format!("failed to serialize snapshot: {err}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| ProcessError::Context(format!("failed to parse snapshot: {err}")))
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write snapshot to {}", path.display()))?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot from {}", path.display()))?;
        Self::from_json(&json)
    }
}

impl ProcessInstance {
    /// 捕获当前状态
    pub fn snapshot(&self) -> ProcessInstanceSnapshot {
        let mut containers: Vec<NodeInstanceContainer> = self.containers.values().cloned().collect();
        containers.sort_by_key(|container| container_order(container.key));
        ProcessInstanceSnapshot {
            version: SNAPSHOT_VERSION,
            id: self.id,
            process_id: self.definition.id.clone(),
            process_version: self.definition.version.clone(),
            config: self.config.clone(),
            state: self.state,
            outcome: self.outcome.clone(),
            fault: self.fault.clone(),
            next_node_instance_id: self.next_node_instance_id,
            next_work_item_id: self.next_work_item_id,
            completed: self.completed.clone(),
            node_instances: self.node_instances.values().cloned().collect(),
            containers,
            execution_queues: self.execution_queues.clone(),
            work_items: self.work_items.values().cloned().collect(),
        }
    }

    /// 从快照恢复
    ///
    /// 定义必须与快照的流程 ID 一致，所有节点引用都必须能在定义中找到。
    pub fn restore(
        snapshot: ProcessInstanceSnapshot,
        definition: Arc<ProcessDefinition>,
        environment: Arc<ProcessEnvironment>,
    ) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ProcessError::Context(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.process_id != definition.id {
            return Err(ProcessError::InvalidDefinition(format!(
                "snapshot of process `{}` cannot be restored with definition `{}`",
                snapshot.process_id, definition.id
            )));
        }
        for instance in &snapshot.node_instances {
            definition.require_node(instance.node_id)?;
        }
        for container in &snapshot.containers {
            if let ContainerDef::Node(node) = container.definition {
                definition.require_node(node)?;
            }
        }

        let node_instances: BTreeMap<NodeInstanceId, NodeInstance> = snapshot
            .node_instances
            .into_iter()
            .map(|instance| (instance.id, instance))
            .collect();
        let mut containers: HashMap<ContainerKey, NodeInstanceContainer> = snapshot
            .containers
            .into_iter()
            .map(|container| (container.key, container))
            .collect();
        if !containers.contains_key(&ContainerKey::Process) {
            return Err(ProcessError::UnknownContainer(ContainerKey::Process.to_string()));
        }
        for instance in node_instances.values() {
            let container = containers
                .get_mut(&instance.container)
                .ok_or_else(|| ProcessError::UnknownContainer(instance.container.to_string()))?;
            if !container.contains(instance.id) {
                container.add(instance.id);
            }
        }

        debug!(
            process_instance = snapshot.id,
            process_id = %snapshot.process_id,
            live = node_instances.len(),
            "process instance restored"
        );
        Ok(Self {
            id: snapshot.id,
            definition,
            environment,
            config: snapshot.config,
            state: snapshot.state,
            outcome: snapshot.outcome,
            fault: snapshot.fault,
            next_node_instance_id: snapshot.next_node_instance_id,
            next_work_item_id: snapshot.next_work_item_id,
            completed: snapshot.completed,
            node_instances,
            containers,
            execution_queues: snapshot.execution_queues,
            work_items: snapshot
                .work_items
                .into_iter()
                .map(|item| (item.id, item))
                .collect(),
        })
    }
}

fn container_order(key: ContainerKey) -> (u8, u64) {
    match key {
        ContainerKey::Process => (0, 0),
        ContainerKey::Node(id) => (1, id),
        ContainerKey::Compensation(ContainerDef::Process) => (2, 0),
        ContainerKey::Compensation(ContainerDef::Node(id)) => (2, id + 1),
    }
}
