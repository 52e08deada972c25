use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::flow::types::ContainerDef;
use crate::runtime::node_instance::NodeInstanceId;
use crate::state::ContextInstances;

/// 运行时容器键
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKey {
    /// 流程实例本身
    Process,
    /// 复合节点实例（子流程、事件子流程）
    Node(NodeInstanceId),
    /// 某个静态容器的补偿作用域，处理器实例在其中运行
    Compensation(ContainerDef),
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKey::Process => f.write_str("process"),
            ContainerKey::Node(id) => write!(f, "node instance {id}"),
            ContainerKey::Compensation(def) => write!(f, "compensation scope of {def}"),
        }
    }
}

/// 容器种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Process,
    SubProcess,
    EventSubProcess,
    Compensation,
}

/// 容器状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Active,
    Completed,
    Aborted,
}

/// 互斥组：竞争中的节点实例，第一个完成者取消其余成员
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusiveGroupInstance {
    members: Vec<NodeInstanceId>,
}

impl ExclusiveGroupInstance {
    pub fn new(members: Vec<NodeInstanceId>) -> Self {
        Self { members }
    }

    pub fn contains(&self, id: NodeInstanceId) -> bool {
        self.members.contains(&id)
    }

    pub fn members(&self) -> &[NodeInstanceId] {
        &self.members
    }
}

/// 节点实例容器
///
/// 持有活动实例集合、迭代层级、上下文实例与互斥组。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInstanceContainer {
    pub key: ContainerKey,
    pub kind: ContainerKind,
    /// 托管节点所在的静态容器
    pub definition: ContainerDef,
    pub state: ContainerState,
    live: Vec<NodeInstanceId>,
    iteration_levels: HashMap<String, u32>,
    current_level: u32,
    #[serde(default)]
    contexts: ContextInstances,
    #[serde(default)]
    exclusive_groups: Vec<ExclusiveGroupInstance>,
}

impl NodeInstanceContainer {
    pub fn new(key: ContainerKey, kind: ContainerKind, definition: ContainerDef) -> Self {
        Self {
            key,
            kind,
            definition,
            state: ContainerState::Active,
            live: Vec::new(),
            iteration_levels: HashMap::new(),
            current_level: 0,
            contexts: ContextInstances::default(),
            exclusive_groups: Vec::new(),
        }
    }

    /// 活动实例，按创建顺序
    pub fn node_instances(&self) -> &[NodeInstanceId] {
        &self.live
    }

    pub fn contains(&self, id: NodeInstanceId) -> bool {
        self.live.contains(&id)
    }

    pub(crate) fn add(&mut self, id: NodeInstanceId) {
        self.live.push(id);
    }

    pub(crate) fn remove(&mut self, id: NodeInstanceId) -> bool {
        let before = self.live.len();
        self.live.retain(|live| *live != id);
        before != self.live.len()
    }

    pub fn current_level(&self) -> u32 {
        self.current_level
    }

    pub(crate) fn set_current_level(&mut self, level: u32) {
        self.current_level = level;
    }

    pub fn iteration_level(&self, unique_id: &str) -> Option<u32> {
        self.iteration_levels.get(unique_id).copied()
    }

    /// 为新建实例计算并记录层级
    pub(crate) fn level_for_node(&mut self, unique_id: &str, loop_level_disabled: bool) -> u32 {
        if loop_level_disabled {
            return 1;
        }
        let current = self.current_level;
        let level = match self.iteration_levels.get(unique_id).copied() {
            None if current == 0 => 1,
            None => current,
            Some(value) if current > 0 && value > current => current,
            Some(value) => value + 1,
        };
        self.iteration_levels.insert(unique_id.to_string(), level);
        level
    }

    pub(crate) fn clear_iteration_level(&mut self, unique_id: &str) {
        self.iteration_levels.remove(unique_id);
    }

    pub fn contexts(&self) -> &ContextInstances {
        &self.contexts
    }

    pub(crate) fn contexts_mut(&mut self) -> &mut ContextInstances {
        &mut self.contexts
    }

    pub fn exclusive_groups(&self) -> &[ExclusiveGroupInstance] {
        &self.exclusive_groups
    }

    pub(crate) fn add_exclusive_group(&mut self, group: ExclusiveGroupInstance) {
        self.exclusive_groups.push(group);
    }

    /// 取出包含 `id` 的互斥组
    pub(crate) fn take_exclusive_group(&mut self, id: NodeInstanceId) -> Option<ExclusiveGroupInstance> {
        let pos = self
            .exclusive_groups
            .iter()
            .position(|group| group.contains(id))?;
        Some(self.exclusive_groups.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> NodeInstanceContainer {
        NodeInstanceContainer::new(ContainerKey::Process, ContainerKind::Process, ContainerDef::Process)
    }

    #[test]
    fn first_level_without_cursor_is_one() {
        let mut c = container();
        assert_eq!(c.level_for_node("1", false), 1);
        // 未清除时再次进入同一节点，层级递增
        assert_eq!(c.level_for_node("1", false), 2);
    }

    #[test]
    fn cursor_caps_recorded_level() {
        let mut c = container();
        c.set_current_level(3);
        assert_eq!(c.level_for_node("2", false), 3);
        assert_eq!(c.level_for_node("2", false), 4);
        c.set_current_level(2);
        assert_eq!(c.level_for_node("2", false), 2);
    }

    #[test]
    fn cleared_level_restarts_from_cursor() {
        let mut c = container();
        c.set_current_level(1);
        assert_eq!(c.level_for_node("3", false), 1);
        c.clear_iteration_level("3");
        assert_eq!(c.iteration_level("3"), None);
        assert_eq!(c.level_for_node("3", false), 1);
    }

    #[test]
    fn disabled_levels_are_always_one() {
        let mut c = container();
        c.set_current_level(5);
        assert_eq!(c.level_for_node("4", true), 1);
        assert_eq!(c.iteration_level("4"), None);
    }

    #[test]
    fn exclusive_group_is_taken_once() {
        let mut c = container();
        c.add_exclusive_group(ExclusiveGroupInstance::new(vec![4, 5]));
        assert_eq!(c.take_exclusive_group(5).map(|g| g.members().to_vec()), Some(vec![4, 5]));
        assert!(c.take_exclusive_group(4).is_none());
        assert!(c.exclusive_groups().is_empty());
    }
}
