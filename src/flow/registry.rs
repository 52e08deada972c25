use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ProcessError, Result};
use crate::flow::types::ProcessDefinition;

/// 流程定义注册表
#[derive(Default)]
pub struct ProcessRegistry {
    processes: HashMap<String, Arc<ProcessDefinition>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
        }
    }

    /// 注册流程定义，同 ID 的旧定义被替换
    pub fn register(&mut self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let definition = Arc::new(definition);
        self.processes
            .insert(definition.id.clone(), Arc::clone(&definition));
        definition
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        self.processes.get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<ProcessDefinition>> {
        self.get(id)
            .ok_or_else(|| ProcessError::ProcessNotRegistered(id.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &Arc<ProcessDefinition>> {
        self.processes.values()
    }
}
