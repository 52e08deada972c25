use std::fmt;

use thiserror::Error;

use crate::runtime::{NodeInstanceId, ProcessInstanceId, ProcessState};

pub type Result<T> = std::result::Result<T, ProcessError>;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unknown node `{0}` in process")]
    UnknownNode(String),
    #[error("unknown node instance `{0}`")]
    UnknownNodeInstance(NodeInstanceId),
    #[error("unknown node instance container `{0}`")]
    UnknownContainer(String),
    #[error("process `{0}` not registered")]
    ProcessNotRegistered(String),
    #[error("process instance `{0}` not found")]
    ProcessInstanceNotFound(ProcessInstanceId),
    #[error("illegal node kind `{kind}` for node `{node}`: {reason}")]
    IllegalNodeKind {
        node: String,
        kind: String,
        reason: String,
    },
    #[error("completing node `{0}` that has no outgoing connection is not supported")]
    UncontrolledFlow(String),
    #[error("uncontrolled flow node `{0}` could not find at least one valid outgoing connection")]
    UnsatisfiedOutgoingFlow(String),
    #[error("could not find compensation handler for `{0}`")]
    UnknownCompensationHandler(String),
    #[error("compensation can only be triggered with string events, not `{0}`")]
    InvalidSignalPayload(String),
    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),
    #[error("node handler `{0}` not registered")]
    NodeHandlerNotRegistered(String),
    #[error("work item `{0}` not found")]
    UnknownWorkItem(u64),
    #[error("process instance {id} is {state:?}, expected Active")]
    InvalidState {
        id: ProcessInstanceId,
        state: ProcessState,
    },
    #[error(transparent)]
    Runtime(#[from] Box<WorkflowRuntimeError>),
    #[error("context error: {0}")]
    Context(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessError {
    /// 构造携带节点实例与流程实例信息的运行时故障
    pub fn runtime(
        node_instance: Option<NodeInstanceId>,
        process_instance: ProcessInstanceId,
        message: impl Into<String>,
        cause: Option<anyhow::Error>,
    ) -> Self {
        ProcessError::Runtime(Box::new(WorkflowRuntimeError {
            node_instance,
            process_instance,
            message: message.into(),
            cause,
        }))
    }

    pub fn as_runtime(&self) -> Option<&WorkflowRuntimeError> {
        match self {
            ProcessError::Runtime(inner) => Some(inner),
            _ => None,
        }
    }
}

/// 流程运行时故障
///
/// 所有致命故障最终都以该类型交给调用方：出错的节点实例（可能为空）、
/// 流程实例、描述信息以及可选的原因。
#[derive(Debug)]
pub struct WorkflowRuntimeError {
    pub node_instance: Option<NodeInstanceId>,
    pub process_instance: ProcessInstanceId,
    pub message: String,
    pub cause: Option<anyhow::Error>,
}

impl WorkflowRuntimeError {
    /// 沿原因链查找第一个 `ActionFault`
    pub fn action_fault(&self) -> Option<&ActionFault> {
        let cause = self.cause.as_ref()?;
        cause.chain().find_map(|err| err.downcast_ref::<ActionFault>())
    }

    /// 沿原因链查找嵌套的 `ProcessError`
    pub fn process_error(&self) -> Option<&ProcessError> {
        let cause = self.cause.as_ref()?;
        cause.chain().find_map(|err| err.downcast_ref::<ProcessError>())
    }
}

impl fmt::Display for WorkflowRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node_instance {
            Some(node_instance) => write!(
                f,
                "[process instance {} / node instance {}] {}",
                self.process_instance, node_instance, self.message
            ),
            None => write!(
                f,
                "[process instance {}] {}",
                self.process_instance, self.message
            ),
        }
    }
}

impl std::error::Error for WorkflowRuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}

/// 节点动作抛出的故障
///
/// `kind` 是故障类型的全限定名，异常作用域按它查找处理器。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ActionFault {
    pub kind: String,
    pub message: String,
}

impl ActionFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// 以错误类型的全限定名作为故障类型
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
        }
    }
}
