use serde::{Deserialize, Serialize};

use crate::flow::types::NodeId;

/// 已处理的故障记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandledFault {
    pub kind: String,
    pub message: String,
    /// 抛出故障的节点实例
    pub node_instance: u64,
    /// 接管控制的处理器节点
    pub handler_node: NodeId,
}

/// 异常作用域实例
///
/// 处理器本身在静态定义里，实例只记录经由本作用域转移过的故障。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionScopeInstance {
    handled: Vec<HandledFault>,
}

impl ExceptionScopeInstance {
    pub fn record(&mut self, fault: HandledFault) {
        self.handled.push(fault);
    }

    pub fn handled(&self) -> &[HandledFault] {
        &self.handled
    }
}
