/// 流程相关的常量定义
///
/// 统一管理连接类型、保留事件名等字符串常量

/// 连接类型常量
pub mod connection {
    /// 未显式指定类型时连接两端使用的类型
    pub const DEFAULT_TYPE: &str = "DROOLS_DEFAULT";
}

/// 保留事件常量
pub mod events {
    /// 补偿信号类型
    pub const COMPENSATION: &str = "Compensation";
    /// 通用补偿的载荷前缀，后接容器唯一 ID
    pub const IMPLICIT_COMPENSATION_PREFIX: &str = "implicit:";
    /// 错误事件子流程的触发类型前缀，后接故障类型
    pub const ERROR_PREFIX: &str = "Error-";

    /// 构造错误事件类型
    pub fn error_event(kind: &str) -> String {
        format!("{ERROR_PREFIX}{kind}")
    }

    /// 构造通用补偿载荷
    pub fn implicit_compensation(container_unique_id: &str) -> String {
        format!("{IMPLICIT_COMPENSATION_PREFIX}{container_unique_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::events;

    #[test]
    fn reserved_event_names_are_composed() {
        assert_eq!(events::error_event("io::Error"), "Error-io::Error");
        assert_eq!(events::implicit_compensation("order"), "implicit:order");
    }
}
