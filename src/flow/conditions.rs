use serde_json::Value;
use std::sync::Arc;

use crate::error::ActionFault;
use crate::runtime::{ConditionContext, NodeContext};

/// 连接约束条件
///
/// 以离开节点的作用域求值，只读访问流程变量。
pub type Condition = Arc<dyn Fn(&ConditionContext<'_>) -> bool + Send + Sync>;

/// 节点动作
///
/// 返回 `Err(ActionFault)` 时引擎按故障类型查找异常作用域。
pub type ActionFn = Arc<dyn Fn(&mut NodeContext<'_>) -> Result<(), ActionFault> + Send + Sync>;

/// 从函数创建条件
pub fn condition_from_fn<F>(func: F) -> Condition
where
    F: Fn(&ConditionContext<'_>) -> bool + Send + Sync + 'static,
{
    Arc::new(func)
}

/// 总是为真的条件
pub fn condition_always() -> Condition {
    condition_from_fn(|_| true)
}

/// 变量等于指定值的条件
pub fn condition_variable_equals<K, V>(name: K, expected: V) -> Condition
where
    K: Into<String>,
    V: Into<Value>,
{
    let name = name.into();
    let expected = expected.into();
    condition_from_fn(move |ctx| ctx.get_variable(&name).as_ref() == Some(&expected))
}

/// 变量不等于指定值的条件（未设置视为不等）
pub fn condition_variable_not_equals<K, V>(name: K, value: V) -> Condition
where
    K: Into<String>,
    V: Into<Value>,
{
    let name = name.into();
    let value = value.into();
    condition_from_fn(move |ctx| ctx.get_variable(&name).as_ref() != Some(&value))
}

/// 变量存在且非 null 的条件
pub fn condition_variable_exists<K: Into<String>>(name: K) -> Condition {
    let name = name.into();
    condition_from_fn(move |ctx| matches!(ctx.get_variable(&name), Some(value) if !value.is_null()))
}

/// 变量不存在的条件
pub fn condition_variable_absent<K: Into<String>>(name: K) -> Condition {
    let name = name.into();
    condition_from_fn(move |ctx| ctx.get_variable(&name).map_or(true, |value| value.is_null()))
}

/// 从函数创建动作
pub fn action_from_fn<F>(func: F) -> ActionFn
where
    F: Fn(&mut NodeContext<'_>) -> Result<(), ActionFault> + Send + Sync + 'static,
{
    Arc::new(func)
}

/// 什么也不做的动作
pub fn action_noop() -> ActionFn {
    action_from_fn(|_| Ok(()))
}
