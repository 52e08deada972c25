use once_cell::unsync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::flow::types::NodeId;
use crate::runtime::container::ContainerKey;

/// 节点实例 ID（流程实例内单调递增）
pub type NodeInstanceId = u64;

/// 节点实例元数据
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInstanceMetadata {
    /// 触发本实例的连接唯一 ID
    pub incoming_connection: Option<String>,
    /// 最近一次离开时使用的连接唯一 ID
    pub outgoing_connection: Option<String>,
    pub hidden: bool,
}

/// 节点类型相关的实例状态
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeInstanceState {
    #[default]
    None,
    /// 汇聚网关：各来源节点的到达次数
    Join { arrivals: BTreeMap<NodeId, u32> },
    WorkItem { work_item_id: u64 },
    /// 事件子流程：本次运行的事件开始节点
    EventSubProcess { start: Option<NodeId> },
}

/// 节点实例
///
/// 在所属容器的活动集合中即为活动状态；移除后不可恢复。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeInstanceId,
    pub node_id: NodeId,
    pub container: ContainerKey,
    pub level: u32,
    pub metadata: NodeInstanceMetadata,
    #[serde(default)]
    pub state: NodeInstanceState,
    #[serde(skip)]
    pub(crate) unique_id: OnceCell<String>,
}

impl NodeInstance {
    pub(crate) fn new(
        id: NodeInstanceId,
        node_id: NodeId,
        container: ContainerKey,
        level: u32,
        hidden: bool,
    ) -> Self {
        Self {
            id,
            node_id,
            container,
            level,
            metadata: NodeInstanceMetadata {
                hidden,
                ..NodeInstanceMetadata::default()
            },
            state: NodeInstanceState::None,
            unique_id: OnceCell::new(),
        }
    }

    /// 已计算过的唯一路径（见 `ProcessInstance::node_instance_unique_id`）
    pub fn cached_unique_id(&self) -> Option<&str> {
        self.unique_id.get().map(String::as_str)
    }
}

/// 触发来源
///
/// 来源实例完成后可能已被移除，这里保存触发下游所需的全部信息。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSource {
    pub node_instance: NodeInstanceId,
    pub node_id: NodeId,
    pub level: u32,
    pub container: ContainerKey,
}

impl TriggerSource {
    pub fn of(instance: &NodeInstance) -> Self {
        Self {
            node_instance: instance.id,
            node_id: instance.node_id,
            level: instance.level,
            container: instance.container,
        }
    }
}
