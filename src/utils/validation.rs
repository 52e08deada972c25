use crate::error::{ProcessError, Result};
use crate::flow::nodes::NodeKind;
use crate::flow::types::{ContainerDef, ProcessDefinition};

/// 流程定义验证器
pub struct DefinitionValidator;

impl DefinitionValidator {
    /// 验证完整的流程定义
    pub fn validate(definition: &ProcessDefinition) -> Result<()> {
        Self::validate_process_id(&definition.id)?;

        if definition.start_nodes(ContainerDef::Process).is_empty() {
            return Err(invalid(format!(
                "流程 '{}' 缺少普通开始节点",
                definition.id
            )));
        }

        for node in definition.nodes() {
            Self::validate_node_name(&node.name)?;
            match &node.kind {
                NodeKind::SubProcess => {
                    if definition.start_nodes(ContainerDef::Node(node.id)).is_empty() {
                        return Err(invalid(format!("子流程 '{}' 缺少开始节点", node.name)));
                    }
                }
                NodeKind::EventSubProcess(_) => {
                    let has_event_start = definition
                        .nodes_in(ContainerDef::Node(node.id))
                        .any(|child| matches!(&child.kind, NodeKind::Start(start) if start.trigger.is_some()));
                    if !has_event_start {
                        return Err(invalid(format!(
                            "事件子流程 '{}' 缺少事件开始节点",
                            node.name
                        )));
                    }
                }
                NodeKind::BoundaryEvent(boundary) => {
                    let attached = definition.node(boundary.attached_to).ok_or_else(|| {
                        ProcessError::UnknownNode(boundary.attached_to.to_string())
                    })?;
                    if attached.container != node.container {
                        return Err(invalid(format!(
                            "边界事件 '{}' 必须与附着活动 '{}' 位于同一容器",
                            node.name, attached.name
                        )));
                    }
                    if matches!(attached.kind, NodeKind::BoundaryEvent(_)) {
                        return Err(ProcessError::IllegalNodeKind {
                            node: attached.name.clone(),
                            kind: attached.kind.kind_name().to_string(),
                            reason: "boundary events cannot carry boundary events".to_string(),
                        });
                    }
                }
                _ => {}
            }
        }

        for decls in definition.contexts.values() {
            if let Some(scope) = &decls.exception {
                for handler in scope.handlers.values() {
                    definition.require_node(handler.handler_node)?;
                }
            }
        }

        Ok(())
    }

    /// 验证流程 ID
    pub fn validate_process_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(invalid("流程 ID 不能为空"));
        }

        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(invalid(format!(
                "流程 ID '{}' 包含无效字符，应该只包含字母、数字、下划线、点和短横线",
                id
            )));
        }

        Ok(())
    }

    /// 验证节点名称
    pub fn validate_node_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(invalid("节点名称不能为空"));
        }
        if name.len() > 100 {
            return Err(invalid(format!("节点名称 '{}' 过长（最多 100 字符）", name)));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ProcessError {
    ProcessError::InvalidDefinition(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::builder::ProcessBuilder;

    #[test]
    fn test_validate_process_id() {
        assert!(DefinitionValidator::validate_process_id("").is_err());
        assert!(DefinitionValidator::validate_process_id("order-flow.v2").is_ok());
        assert!(DefinitionValidator::validate_process_id("order flow").is_err());
        assert!(DefinitionValidator::validate_process_id("order:flow").is_err());
    }

    #[test]
    fn test_missing_start_is_rejected() {
        let mut builder = ProcessBuilder::new("no_start", "No start");
        builder.add_end("end");
        assert!(matches!(
            builder.build(),
            Err(ProcessError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_event_sub_process_requires_event_start() {
        let mut builder = ProcessBuilder::new("esp", "Event sub-process");
        builder
            .add_start("start")
            .add_end("end")
            .connect("start", "end")
            .add_event_sub_process("handler", |esp| {
                esp.add_start("plain").add_end("esp_end").connect("plain", "esp_end");
            });
        assert!(matches!(
            builder.build(),
            Err(ProcessError::InvalidDefinition(_))
        ));
    }
}
