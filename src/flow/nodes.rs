use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::flow::conditions::ActionFn;
use crate::flow::types::{ContainerDef, NodeId};

/// 流程节点定义
#[derive(Clone, Debug)]
pub struct NodeDefinition {
    pub id: NodeId,
    pub name: String,
    /// 完成日志、迭代层级与补偿处理器都以它为键
    pub unique_id: String,
    pub kind: NodeKind,
    /// 节点所在的静态容器
    pub container: ContainerDef,
    /// 隐藏节点不触发观察事件
    pub hidden: bool,
    /// 补偿处理器节点，只能经由补偿关联进入
    pub for_compensation: bool,
    pub metadata: BTreeMap<String, Value>,
}

impl NodeDefinition {
    pub fn is_composite(&self) -> bool {
        matches!(self.kind, NodeKind::SubProcess | NodeKind::EventSubProcess(_))
    }
}

/// 节点类型
#[derive(Clone)]
pub enum NodeKind {
    Start(StartNode),
    End { terminate: bool },
    Action(ActionFn),
    WorkItem(WorkItemNode),
    Split(SplitKind),
    Join(JoinKind),
    /// 等待外部信号的中间事件
    EventWait {
        event_type: String,
        variable: Option<String>,
    },
    BoundaryEvent(BoundaryEventNode),
    SubProcess,
    EventSubProcess(EventSubProcessNode),
    /// 中间补偿抛出事件，`activity_ref` 为空时补偿所在容器
    CompensationThrow { activity_ref: Option<String> },
    Fault(FaultNode),
    /// 由 `NodeHandler` 插件实现的节点
    Custom { handler: String },
}

impl NodeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Start(_) => "start",
            NodeKind::End { .. } => "end",
            NodeKind::Action(_) => "action",
            NodeKind::WorkItem(_) => "work_item",
            NodeKind::Split(_) => "split",
            NodeKind::Join(_) => "join",
            NodeKind::EventWait { .. } => "event_wait",
            NodeKind::BoundaryEvent(_) => "boundary_event",
            NodeKind::SubProcess => "sub_process",
            NodeKind::EventSubProcess(_) => "event_sub_process",
            NodeKind::CompensationThrow { .. } => "compensation_throw",
            NodeKind::Fault(_) => "fault",
            NodeKind::Custom { .. } => "custom",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Start(start) => f.debug_tuple("Start").field(start).finish(),
            NodeKind::End { terminate } => {
                f.debug_struct("End").field("terminate", terminate).finish()
            }
            NodeKind::Action(_) => f.write_str("Action(<fn>)"),
            NodeKind::WorkItem(work) => f.debug_tuple("WorkItem").field(work).finish(),
            NodeKind::Split(kind) => f.debug_tuple("Split").field(kind).finish(),
            NodeKind::Join(kind) => f.debug_tuple("Join").field(kind).finish(),
            NodeKind::EventWait {
                event_type,
                variable,
            } => f
                .debug_struct("EventWait")
                .field("event_type", event_type)
                .field("variable", variable)
                .finish(),
            NodeKind::BoundaryEvent(boundary) => {
                f.debug_tuple("BoundaryEvent").field(boundary).finish()
            }
            NodeKind::SubProcess => f.write_str("SubProcess"),
            NodeKind::EventSubProcess(node) => {
                f.debug_tuple("EventSubProcess").field(node).finish()
            }
            NodeKind::CompensationThrow { activity_ref } => f
                .debug_struct("CompensationThrow")
                .field("activity_ref", activity_ref)
                .finish(),
            NodeKind::Fault(fault) => f.debug_tuple("Fault").field(fault).finish(),
            NodeKind::Custom { handler } => {
                f.debug_struct("Custom").field("handler", handler).finish()
            }
        }
    }
}

/// 开始节点
#[derive(Clone, Debug, Default)]
pub struct StartNode {
    /// 事件开始节点的触发类型；`None` 为普通开始节点
    pub trigger: Option<String>,
    pub interrupting: bool,
    /// 中断型事件子流程结束时用作终止原因
    pub fault_code: Option<String>,
    /// 信号载荷写入的变量
    pub variable: Option<String>,
}

/// 工作项节点
#[derive(Clone, Debug, Default)]
pub struct WorkItemNode {
    /// 用于查找 `WorkItemHandler`
    pub name: String,
    pub parameters: BTreeMap<String, Value>,
    /// 参数名 -> 变量名
    pub input_mappings: BTreeMap<String, String>,
    /// 结果键 -> 变量名
    pub output_mappings: BTreeMap<String, String>,
}

/// 分支网关类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitKind {
    /// 所有出口
    And,
    /// 优先级最高的满足条件的出口
    Xor,
    /// 所有满足条件的出口
    Or,
    /// 所有出口，下游实例组成互斥组
    EventBased,
}

/// 汇聚网关类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    /// 等待每条入口至少到达一次
    And,
    /// 每次到达都放行
    Xor,
}

/// 边界事件
#[derive(Clone, Debug)]
pub struct BoundaryEventNode {
    pub attached_to: NodeId,
    pub event_type: String,
    /// 中断型边界事件在放行前取消所附着的活动
    pub cancel_activity: bool,
}

/// 事件子流程
#[derive(Clone, Debug)]
pub struct EventSubProcessNode {
    /// 内部结束节点到达后完成自身
    pub keep_active: bool,
}

impl Default for EventSubProcessNode {
    fn default() -> Self {
        Self { keep_active: true }
    }
}

/// 故障结束节点
#[derive(Clone, Debug)]
pub struct FaultNode {
    pub kind: String,
    pub message: Option<String>,
}
