// 运行时执行引擎模块

mod container;
mod environment;
mod events;
mod handlers;
mod node_instance;
mod nodes;
mod process_instance;
mod protocol;
mod queue;
mod scope;
mod session;
mod signals;
mod snapshot;
mod work;

pub use container::{
    ContainerKey, ContainerKind, ContainerState, ExclusiveGroupInstance, NodeInstanceContainer,
};
pub use environment::ProcessEnvironment;
pub use events::{
    EventPhase, EventRecorder, NodeEvent, ProcessEvent, ProcessEventListener, RecordedEvent,
};
pub use handlers::{register_node_handler, NodeHandler, NodeHandlerRegistry, NodeOutcome};
pub use node_instance::{
    NodeInstance, NodeInstanceId, NodeInstanceMetadata, NodeInstanceState, TriggerSource,
};
pub use process_instance::{FaultRecord, ProcessInstance, ProcessInstanceId, ProcessState};
pub use queue::QueuedAction;
pub use scope::{ConditionContext, NodeContext};
pub use session::{
    ProcessSession, SharedProcessInstance, TransactionStatus, TransactionSynchronization,
};
pub use snapshot::ProcessInstanceSnapshot;
pub use work::{
    register_work_item_handler, AutoCompleteHandler, WorkItem, WorkItemHandler,
    WorkItemHandlerRegistry, WorkItemOutcome, WorkItemState,
};
