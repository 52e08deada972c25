use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{ProcessError, Result};
use crate::flow::connections::ConnectionDefinition;
use crate::flow::contexts::{ContextDeclarations, ContextKind};
use crate::flow::nodes::{NodeDefinition, NodeKind, StartNode};

/// 流程核心类型定义

/// 节点 ID（流程内唯一）
pub type NodeId = u64;

/// 静态容器：流程本身或某个复合节点
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerDef {
    Process,
    Node(NodeId),
}

impl fmt::Display for ContainerDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerDef::Process => f.write_str("process"),
            ContainerDef::Node(id) => write!(f, "node {id}"),
        }
    }
}

/// 流程定义
///
/// 构建后不可变，可在多个流程实例之间共享。
#[derive(Clone, Debug)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub(crate) nodes: BTreeMap<NodeId, NodeDefinition>,
    pub(crate) children: HashMap<ContainerDef, Vec<NodeId>>,
    pub(crate) connections: Vec<ConnectionDefinition>,
    pub(crate) outgoing: HashMap<NodeId, Vec<usize>>,
    pub(crate) incoming: HashMap<NodeId, Vec<usize>>,
    pub(crate) contexts: HashMap<ContainerDef, ContextDeclarations>,
}

impl ProcessDefinition {
    pub fn node(&self, id: NodeId) -> Option<&NodeDefinition> {
        self.nodes.get(&id)
    }

    pub fn require_node(&self, id: NodeId) -> Result<&NodeDefinition> {
        self.nodes
            .get(&id)
            .ok_or_else(|| ProcessError::UnknownNode(id.to_string()))
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.values().find(|node| node.name == name)
    }

    /// 按唯一 ID 查找节点（包括嵌套容器内的节点）
    pub fn find_node_by_unique_id(&self, unique_id: &str) -> Option<&NodeDefinition> {
        self.nodes.values().find(|node| node.unique_id == unique_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.nodes.values()
    }

    /// 直接位于 `container` 中的节点，按 ID 排序
    pub fn nodes_in(&self, container: ContainerDef) -> impl Iterator<Item = &NodeDefinition> {
        self.children
            .get(&container)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    pub fn connections(&self) -> &[ConnectionDefinition] {
        &self.connections
    }

    /// 指定类型的出口连接，保持声明顺序
    pub fn outgoing_connections<'a>(
        &'a self,
        node: NodeId,
        from_type: &'a str,
    ) -> impl Iterator<Item = &'a ConnectionDefinition> + 'a {
        self.indexed(&self.outgoing, node)
            .filter(move |conn| conn.from_type == from_type)
    }

    /// 指定类型的入口连接，保持声明顺序
    pub fn incoming_connections<'a>(
        &'a self,
        node: NodeId,
        to_type: &'a str,
    ) -> impl Iterator<Item = &'a ConnectionDefinition> + 'a {
        self.indexed(&self.incoming, node)
            .filter(move |conn| conn.to_type == to_type)
    }

    fn indexed<'a>(
        &'a self,
        index: &'a HashMap<NodeId, Vec<usize>>,
        node: NodeId,
    ) -> impl Iterator<Item = &'a ConnectionDefinition> + 'a {
        index
            .get(&node)
            .into_iter()
            .flatten()
            .filter_map(|idx| self.connections.get(*idx))
    }

    /// 节点是否有带约束的出口
    pub fn has_constraints(&self, node: NodeId) -> bool {
        self.indexed(&self.outgoing, node)
            .any(|conn| conn.constraint.is_some())
    }

    pub fn contexts(&self, container: ContainerDef) -> Option<&ContextDeclarations> {
        self.contexts.get(&container)
    }

    /// 复合节点的静态父容器；流程容器没有父容器
    pub fn parent_of(&self, container: ContainerDef) -> Option<ContainerDef> {
        match container {
            ContainerDef::Process => None,
            ContainerDef::Node(id) => self.nodes.get(&id).map(|node| node.container),
        }
    }

    /// 容器唯一 ID：流程为流程 ID，复合节点为节点唯一 ID
    pub fn container_unique_id(&self, container: ContainerDef) -> Option<&str> {
        match container {
            ContainerDef::Process => Some(self.id.as_str()),
            ContainerDef::Node(id) => self.nodes.get(&id).map(|node| node.unique_id.as_str()),
        }
    }

    /// 普通开始节点（无触发类型）
    pub fn start_nodes(&self, container: ContainerDef) -> Vec<NodeId> {
        self.nodes_in(container)
            .filter(|node| matches!(&node.kind, NodeKind::Start(StartNode { trigger: None, .. })))
            .map(|node| node.id)
            .collect()
    }

    /// 事件子流程中与 `event_type` 匹配的事件开始节点
    pub fn event_start_node(&self, container: ContainerDef, event_type: &str) -> Option<&NodeDefinition> {
        self.nodes_in(container).find(|node| match &node.kind {
            NodeKind::Start(StartNode {
                trigger: Some(trigger),
                ..
            }) => trigger == event_type,
            _ => false,
        })
    }

    /// 沿静态容器链查找为 `key` 声明 `kind` 上下文的最近容器
    pub fn resolve_context(&self, node: NodeId, kind: ContextKind, key: &str) -> Option<ContainerDef> {
        let mut current = Some(self.nodes.get(&node)?.container);
        while let Some(container) = current {
            if self
                .contexts
                .get(&container)
                .is_some_and(|decls| decls.declares(kind, key))
            {
                return Some(container);
            }
            current = self.parent_of(container);
        }
        None
    }
}
