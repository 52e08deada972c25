use std::sync::Arc;

use crate::runtime::events::ProcessEventListener;
use crate::runtime::handlers::{register_node_handler, NodeHandler, NodeHandlerRegistry};
use crate::runtime::work::{register_work_item_handler, WorkItemHandler, WorkItemHandlerRegistry};

/// 流程实例的外部协作者：节点插件、工作项处理器与事件监听器
#[derive(Clone, Default)]
pub struct ProcessEnvironment {
    node_handlers: NodeHandlerRegistry,
    work_item_handlers: WorkItemHandlerRegistry,
    listeners: Vec<Arc<dyn ProcessEventListener>>,
}

impl ProcessEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_handler(mut self, name: &str, handler: Arc<dyn NodeHandler>) -> Self {
        register_node_handler(name, handler, &mut self.node_handlers);
        self
    }

    pub fn with_work_item_handler(mut self, name: &str, handler: Arc<dyn WorkItemHandler>) -> Self {
        register_work_item_handler(name, handler, &mut self.work_item_handlers);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProcessEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn node_handler(&self, name: &str) -> Option<Arc<dyn NodeHandler>> {
        self.node_handlers.get(name).cloned()
    }

    pub fn work_item_handler(&self, name: &str) -> Option<Arc<dyn WorkItemHandler>> {
        self.work_item_handlers.get(name).cloned()
    }

    pub fn listeners(&self) -> &[Arc<dyn ProcessEventListener>] {
        &self.listeners
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl std::fmt::Debug for ProcessEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut node_handlers: Vec<_> = self.node_handlers.keys().collect();
        node_handlers.sort();
        let mut work_item_handlers: Vec<_> = self.work_item_handlers.keys().collect();
        work_item_handlers.sort();
        f.debug_struct("ProcessEnvironment")
            .field("node_handlers", &node_handlers)
            .field("work_item_handlers", &work_item_handlers)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
