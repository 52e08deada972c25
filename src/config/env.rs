use std::env;

pub const ENV_QUEUE_BASED: &str = "PROCFLOW_QUEUE_BASED";
pub const ENV_MULTI_CONNECTION: &str = "PROCFLOW_MULTI_CON";
pub const ENV_LOOP_LEVEL_DISABLED: &str = "PROCFLOW_LOOP_LEVEL_DISABLED";
pub const ENV_DEBUG: &str = "PROCFLOW_DEBUG";

/// 环境变量配置管理
pub struct EnvConfig;

impl EnvConfig {
    /// 获取可选的环境变量
    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok()
    }

    /// 读取布尔开关
    ///
    /// `true`/`1`/`yes`/`on`（忽略大小写）视为开启，其余已设置的值视为关闭，
    /// 未设置时返回 `None`。
    pub fn get_flag(key: &str) -> Option<bool> {
        Self::get_env_optional(key).map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            )
        })
    }

    /// 检查是否启用调试模式
    pub fn is_debug_mode() -> bool {
        env::var(ENV_DEBUG).is_ok()
    }
}
