pub mod config;
pub mod error;
pub mod flow;
pub mod runtime;
pub mod state;
pub mod utils;

pub use config::{EngineConfig, EnvConfig, ExecutionStrategy};
pub use error::{ActionFault, ProcessError, Result, WorkflowRuntimeError};
pub use flow::{
    action_from_fn, action_noop, condition_always, condition_from_fn, condition_variable_absent,
    condition_variable_equals, condition_variable_exists, condition_variable_not_equals,
    ActionFn, Condition, ContainerDef, JoinKind, NodeDefinition, NodeId, NodeKind,
    ProcessBuilder, ProcessDefinition, ProcessRegistry, SplitKind,
};
pub use runtime::{
    AutoCompleteHandler, ConditionContext, ContainerKey, EventPhase, EventRecorder, FaultRecord,
    NodeContext, NodeEvent, NodeHandler, NodeInstance, NodeInstanceId, NodeOutcome,
    ProcessEnvironment, ProcessEvent, ProcessEventListener, ProcessInstance, ProcessInstanceId,
    ProcessInstanceSnapshot, ProcessSession, ProcessState, TransactionStatus,
    TransactionSynchronization, WorkItem, WorkItemHandler, WorkItemOutcome,
};
pub use utils::{logging, validation};
