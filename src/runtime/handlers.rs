use std::collections::HashMap;
use std::sync::Arc;

use crate::runtime::scope::NodeContext;

/// 自定义节点的进入结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeOutcome {
    /// 立即沿出口离开
    Complete,
    /// 停留为等待状态，稍后由 `complete_node_instance` 放行
    Wait,
}

/// 自定义节点插件
///
/// 进入逻辑必须最终完成、取消，或者保持为合法的等待状态。
/// 返回的错误若是 `ActionFault`，引擎按异常作用域处理。
pub trait NodeHandler: Send + Sync {
    fn enter(&self, ctx: &mut NodeContext<'_>) -> anyhow::Result<NodeOutcome>;
}

impl<F> NodeHandler for F
where
    F: Fn(&mut NodeContext<'_>) -> anyhow::Result<NodeOutcome> + Send + Sync,
{
    fn enter(&self, ctx: &mut NodeContext<'_>) -> anyhow::Result<NodeOutcome> {
        self(ctx)
    }
}

/// 节点插件注册表
pub type NodeHandlerRegistry = HashMap<String, Arc<dyn NodeHandler>>;

/// 注册节点插件
pub fn register_node_handler(
    name: &str,
    handler: Arc<dyn NodeHandler>,
    registry: &mut NodeHandlerRegistry,
) {
    registry.insert(name.to_string(), handler);
}
