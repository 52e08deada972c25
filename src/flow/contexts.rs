use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::flow::types::{ContainerDef, NodeId};

/// 作用域上下文类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Variable,
    Exception,
    Compensation,
}

/// 变量声明
#[derive(Clone, Debug, PartialEq)]
pub struct VariableDeclaration {
    pub name: String,
    pub default: Option<Value>,
}

/// 变量作用域
#[derive(Clone, Debug, Default)]
pub struct VariableScope {
    pub variables: Vec<VariableDeclaration>,
}

impl VariableScope {
    pub fn find(&self, name: &str) -> Option<&VariableDeclaration> {
        self.variables.iter().find(|decl| decl.name == name)
    }
}

/// 异常处理器：故障发生时控制转入的节点
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub handler_node: NodeId,
}

/// 异常作用域（故障类型 -> 处理器）
#[derive(Clone, Debug, Default)]
pub struct ExceptionScope {
    pub handlers: BTreeMap<String, ExceptionHandler>,
}

/// 补偿处理器
///
/// 只允许两种节点承担补偿。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompensationHandler {
    /// 附着在活动上的补偿边界事件
    BoundaryEvent { node: NodeId, attached_to: NodeId },
    /// 由补偿开始事件触发的事件子流程，`parent` 完成后才可补偿
    EventSubProcess { node: NodeId, parent: ContainerDef },
}

impl CompensationHandler {
    pub fn node(&self) -> NodeId {
        match self {
            CompensationHandler::BoundaryEvent { node, .. } => *node,
            CompensationHandler::EventSubProcess { node, .. } => *node,
        }
    }
}

/// 补偿作用域（活动唯一 ID -> 处理器）
#[derive(Clone, Debug, Default)]
pub struct CompensationScope {
    pub handlers: BTreeMap<String, CompensationHandler>,
}

/// 容器上声明的全部上下文
#[derive(Clone, Debug, Default)]
pub struct ContextDeclarations {
    pub variables: Option<VariableScope>,
    pub exception: Option<ExceptionScope>,
    pub compensation: Option<CompensationScope>,
}

impl ContextDeclarations {
    /// 该容器是否为 `key` 声明了 `kind` 类型的上下文
    pub fn declares(&self, kind: ContextKind, key: &str) -> bool {
        match kind {
            ContextKind::Variable => self
                .variables
                .as_ref()
                .is_some_and(|scope| scope.find(key).is_some()),
            ContextKind::Exception => self
                .exception
                .as_ref()
                .is_some_and(|scope| scope.handlers.contains_key(key)),
            ContextKind::Compensation => self
                .compensation
                .as_ref()
                .is_some_and(|scope| scope.handlers.contains_key(key)),
        }
    }

    pub(crate) fn variables_mut(&mut self) -> &mut VariableScope {
        self.variables.get_or_insert_with(VariableScope::default)
    }

    pub(crate) fn exception_mut(&mut self) -> &mut ExceptionScope {
        self.exception.get_or_insert_with(ExceptionScope::default)
    }

    pub(crate) fn compensation_mut(&mut self) -> &mut CompensationScope {
        self.compensation.get_or_insert_with(CompensationScope::default)
    }
}
