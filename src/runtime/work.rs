use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::runtime::node_instance::NodeInstanceId;
use crate::runtime::process_instance::ProcessInstanceId;

/// 工作项状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Pending,
    Completed,
    Aborted,
}

/// 交给外部服务的工作项
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    /// 处理器名称
    pub name: String,
    pub process_instance: ProcessInstanceId,
    pub node_instance: NodeInstanceId,
    pub parameters: BTreeMap<String, Value>,
    pub state: WorkItemState,
}

impl WorkItem {
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }
}

/// 处理器的同步答复
#[derive(Clone, Debug, PartialEq)]
pub enum WorkItemOutcome {
    /// 稍后通过 `complete_work_item` / `abort_work_item` 回调
    Pending,
    Completed(BTreeMap<String, Value>),
    Aborted,
}

/// 工作项处理器
pub trait WorkItemHandler: Send + Sync {
    /// 派发工作项；返回 `ActionFault` 时按异常作用域处理
    fn execute(&self, item: &WorkItem) -> anyhow::Result<WorkItemOutcome>;

    /// 所属节点实例被取消
    fn abort(&self, _item: &WorkItem) {}
}

/// 工作项处理器注册表
pub type WorkItemHandlerRegistry = HashMap<String, Arc<dyn WorkItemHandler>>;

/// 注册工作项处理器
pub fn register_work_item_handler(
    name: impl Into<String>,
    handler: Arc<dyn WorkItemHandler>,
    registry: &mut WorkItemHandlerRegistry,
) {
    registry.insert(name.into(), handler);
}

/// 直接以给定结果完成的处理器
pub struct AutoCompleteHandler {
    results: BTreeMap<String, Value>,
}

impl AutoCompleteHandler {
    pub fn new() -> Self {
        Self {
            results: BTreeMap::new(),
        }
    }

    pub fn with_result(mut self, key: impl Into<String>, value: Value) -> Self {
        self.results.insert(key.into(), value);
        self
    }
}

impl Default for AutoCompleteHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkItemHandler for AutoCompleteHandler {
    fn execute(&self, _item: &WorkItem) -> anyhow::Result<WorkItemOutcome> {
        Ok(WorkItemOutcome::Completed(self.results.clone()))
    }
}
