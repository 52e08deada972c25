// 状态管理模块 - 容器上的作用域上下文实例

mod compensation;
mod context;
mod exception;
mod variables;

pub use compensation::{CompensationRecord, CompensationScopeInstance};
pub use context::ContextInstances;
pub use exception::{ExceptionScopeInstance, HandledFault};
pub use variables::VariableScopeInstance;
