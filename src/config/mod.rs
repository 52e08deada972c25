pub mod env;

pub use env::EnvConfig;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, Result};

/// 执行策略
///
/// 在流程实例创建时选定并随实例持久化，之后不可更改。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// 直接递归触发下游节点
    #[default]
    Recursive,
    /// 通过执行队列延迟触发（stackless）
    QueueBased,
}

impl ExecutionStrategy {
    pub fn is_queue_based(self) -> bool {
        matches!(self, ExecutionStrategy::QueueBased)
    }
}

/// 引擎配置
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub strategy: ExecutionStrategy,
    /// 启用带优先级约束的多连接出口评估
    pub multi_connection: bool,
    /// 关闭迭代层级跟踪，所有节点实例的层级固定为 1
    pub loop_level_disabled: bool,
}

static ENV_DEFAULTS: Lazy<EngineConfig> = Lazy::new(EngineConfig::load_env);

impl EngineConfig {
    pub fn new(strategy: ExecutionStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn recursive() -> Self {
        Self::new(ExecutionStrategy::Recursive)
    }

    pub fn queue_based() -> Self {
        Self::new(ExecutionStrategy::QueueBased)
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_multi_connection(mut self, enabled: bool) -> Self {
        self.multi_connection = enabled;
        self
    }

    pub fn with_loop_level_disabled(mut self, disabled: bool) -> Self {
        self.loop_level_disabled = disabled;
        self
    }

    /// 进程级缓存的环境默认值（首次访问时读取）
    pub fn from_env() -> Self {
        ENV_DEFAULTS.clone()
    }

    /// 读取当前环境变量，不使用缓存
    pub fn load_env() -> Self {
        let mut config = Self::default();
        if EnvConfig::get_flag(env::ENV_QUEUE_BASED).unwrap_or(false) {
            config.strategy = ExecutionStrategy::QueueBased;
        }
        config.multi_connection = EnvConfig::get_flag(env::ENV_MULTI_CONNECTION).unwrap_or(false);
        config.loop_level_disabled =
            EnvConfig::get_flag(env::ENV_LOOP_LEVEL_DISABLED).unwrap_or(false);
        config
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| ProcessError::Context(format!("invalid engine config: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_config_fills_missing_fields_with_defaults() {
        let config = EngineConfig::from_json(r#"{ "strategy": "queue_based" }"#).unwrap();
        assert_eq!(config.strategy, ExecutionStrategy::QueueBased);
        assert!(!config.multi_connection);
        assert!(!config.loop_level_disabled);
    }

    #[test]
    fn invalid_json_is_context_error() {
        let err = EngineConfig::from_json("{ strategy: ").unwrap_err();
        assert!(matches!(err, ProcessError::Context(_)));
    }

    #[test]
    fn load_env_reads_multi_connection_flag() {
        std::env::set_var(env::ENV_MULTI_CONNECTION, "true");
        let config = EngineConfig::load_env();
        std::env::remove_var(env::ENV_MULTI_CONNECTION);
        assert!(config.multi_connection);
    }
}
