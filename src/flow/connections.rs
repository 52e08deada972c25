use std::fmt;

use crate::flow::conditions::Condition;
use crate::flow::types::NodeId;

/// 节点之间的有向连接
#[derive(Clone, Debug)]
pub struct ConnectionDefinition {
    pub unique_id: String,
    pub from: NodeId,
    pub to: NodeId,
    pub from_type: String,
    pub to_type: String,
    pub constraint: Option<Constraint>,
}

/// 连接约束
///
/// 数值越小优先级越高；`is_default` 的连接只在其他约束都不满足时放行。
#[derive(Clone)]
pub struct Constraint {
    pub name: Option<String>,
    pub priority: i32,
    pub is_default: bool,
    pub condition: Option<Condition>,
}

impl Constraint {
    pub fn when(priority: i32, condition: Condition) -> Self {
        Self {
            name: None,
            priority,
            is_default: false,
            condition: Some(condition),
        }
    }

    /// 默认出口
    pub fn otherwise() -> Self {
        Self {
            name: None,
            priority: i32::MAX,
            is_default: true,
            condition: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("is_default", &self.is_default)
            .field("condition", &self.condition.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
