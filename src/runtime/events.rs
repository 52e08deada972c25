use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::flow::types::NodeId;
use crate::runtime::node_instance::NodeInstanceId;
use crate::runtime::process_instance::{ProcessInstanceId, ProcessState};

/// 节点事件
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub process_instance: ProcessInstanceId,
    pub node_instance: NodeInstanceId,
    /// 节点实例的唯一路径，例如 `2:5`
    pub node_instance_unique_id: String,
    pub node_id: NodeId,
    pub node_name: String,
    pub node_unique_id: String,
}

/// 流程事件
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub process_instance: ProcessInstanceId,
    pub process_id: String,
    pub state: ProcessState,
    pub outcome: Option<String>,
}

/// 流程事件监听器
///
/// 仅用于观察，不能影响控制流。隐藏节点不产生节点事件。
pub trait ProcessEventListener: Send + Sync {
    fn before_node_triggered(&self, _event: &NodeEvent) {}
    fn after_node_triggered(&self, _event: &NodeEvent) {}
    fn before_node_left(&self, _event: &NodeEvent) {}
    fn after_node_left(&self, _event: &NodeEvent) {}
    fn after_process_started(&self, _event: &ProcessEvent) {}
    fn after_process_completed(&self, _event: &ProcessEvent) {}
}

/// 节点事件阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    BeforeTriggered,
    AfterTriggered,
    BeforeLeft,
    AfterLeft,
}

/// 记录下来的节点事件
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub phase: EventPhase,
    pub event: NodeEvent,
}

/// 记录全部事件的监听器
#[derive(Default)]
pub struct EventRecorder {
    nodes: Mutex<Vec<RecordedEvent>>,
    processes: Mutex<Vec<ProcessEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, phase: EventPhase, event: &NodeEvent) {
        self.nodes.lock().push(RecordedEvent {
            phase,
            event: event.clone(),
        });
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.nodes.lock().clone()
    }

    /// 指定阶段的节点名称序列
    pub fn names(&self, phase: EventPhase) -> Vec<String> {
        self.nodes
            .lock()
            .iter()
            .filter(|recorded| recorded.phase == phase)
            .map(|recorded| recorded.event.node_name.clone())
            .collect()
    }

    /// "before triggered" 的节点名称序列
    pub fn triggered(&self) -> Vec<String> {
        self.names(EventPhase::BeforeTriggered)
    }

    /// 指定节点实例在某阶段出现的次数
    pub fn count_for(&self, phase: EventPhase, node_instance: NodeInstanceId) -> usize {
        self.nodes
            .lock()
            .iter()
            .filter(|recorded| recorded.phase == phase && recorded.event.node_instance == node_instance)
            .count()
    }

    pub fn process_events(&self) -> Vec<ProcessEvent> {
        self.processes.lock().clone()
    }
}

impl ProcessEventListener for EventRecorder {
    fn before_node_triggered(&self, event: &NodeEvent) {
        self.push(EventPhase::BeforeTriggered, event);
    }

    fn after_node_triggered(&self, event: &NodeEvent) {
        self.push(EventPhase::AfterTriggered, event);
    }

    fn before_node_left(&self, event: &NodeEvent) {
        self.push(EventPhase::BeforeLeft, event);
    }

    fn after_node_left(&self, event: &NodeEvent) {
        self.push(EventPhase::AfterLeft, event);
    }

    fn after_process_started(&self, event: &ProcessEvent) {
        self.processes.lock().push(event.clone());
    }

    fn after_process_completed(&self, event: &ProcessEvent) {
        self.processes.lock().push(event.clone());
    }
}
