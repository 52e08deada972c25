use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::EnvConfig;

const DEFAULT_FILTER: &str = "procflow=info,warn";
const DEBUG_FILTER: &str = "procflow=trace,info";

/// 日志配置
///
/// 引擎只通过 `tracing` 宏输出，订阅者由宿主程序安装。
/// 这里提供与引擎字段（`process_instance`、`node_instance`、`work_item`）相配的默认格式。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` 指令；`RUST_LOG` 优先
    pub filter: String,
    /// 输出源文件、行号与线程
    pub verbose: bool,
    /// 工作单元 span 关闭时输出耗时
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            verbose: false,
            span_events: false,
        }
    }
}

impl LoggingConfig {
    /// 按环境变量构造
    ///
    /// - RUST_LOG: 覆盖过滤指令
    /// - PROCFLOW_DEBUG: 打开触发、队列的 trace 输出以及 span 耗时
    pub fn from_env() -> Self {
        if EnvConfig::is_debug_mode() {
            Self {
                filter: DEBUG_FILTER.to_string(),
                verbose: true,
                span_events: true,
            }
        } else {
            Self::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// 安装全局订阅者
    ///
    /// 已有订阅者时返回 `false`，测试里多次调用是安全的。
    ///
    /// ```no_run
    /// use procflow::utils::LoggingConfig;
    ///
    /// LoggingConfig::from_env().init();
    /// ```
    pub fn init(&self) -> bool {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.filter));
        let span_events = if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let fmt_layer = fmt::layer()
            .with_target(self.verbose)
            .with_file(self.verbose)
            .with_line_number(self.verbose)
            .with_thread_ids(self.verbose)
            .with_span_events(span_events);

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .is_ok();
        if installed {
            tracing::debug!(filter = %self.filter, "logging initialised");
        }
        installed
    }

    /// 测试用：输出交给测试框架捕获
    pub fn init_for_tests() -> bool {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init()
            .is_ok()
    }
}
