use serde::{Deserialize, Serialize};

use crate::flow::types::{ContainerDef, NodeId};

/// 一次补偿处理器调用
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// 被补偿活动的唯一 ID
    pub activity_ref: String,
    pub handler_node: NodeId,
    /// 处理器节点实例
    pub node_instance: u64,
}

/// 补偿作用域实例
///
/// 记录按调用顺序入栈，栈顶总是最近一次调用。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationScopeInstance {
    scope: ContainerDef,
    stack: Vec<CompensationRecord>,
}

impl CompensationScopeInstance {
    pub fn new(scope: ContainerDef) -> Self {
        Self {
            scope,
            stack: Vec::new(),
        }
    }

    pub fn scope(&self) -> ContainerDef {
        self.scope
    }

    pub fn push(&mut self, record: CompensationRecord) {
        self.stack.push(record);
    }

    pub fn last(&self) -> Option<&CompensationRecord> {
        self.stack.last()
    }

    /// 从栈底到栈顶
    pub fn records(&self) -> &[CompensationRecord] {
        &self.stack
    }
}
