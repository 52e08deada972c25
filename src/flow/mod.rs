// Flow 模块 - 静态流程定义

pub mod builder;
pub mod conditions;
pub mod connections;
pub mod constants;
pub mod contexts;
pub mod nodes;
pub mod registry;
pub mod types;

// 重新导出核心类型
pub use builder::ProcessBuilder;
pub use conditions::{
    action_from_fn, action_noop, condition_always, condition_from_fn,
    condition_variable_absent, condition_variable_equals, condition_variable_exists,
    condition_variable_not_equals, ActionFn, Condition,
};
pub use connections::{ConnectionDefinition, Constraint};
pub use contexts::{
    CompensationHandler, CompensationScope, ContextDeclarations, ContextKind, ExceptionHandler,
    ExceptionScope, VariableDeclaration, VariableScope,
};
pub use nodes::{
    BoundaryEventNode, EventSubProcessNode, FaultNode, JoinKind, NodeDefinition, NodeKind,
    SplitKind, StartNode, WorkItemNode,
};
pub use registry::ProcessRegistry;
pub use types::{ContainerDef, NodeId, ProcessDefinition};
