use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::Result;
use crate::runtime::node_instance::{NodeInstanceId, TriggerSource};
use crate::runtime::process_instance::ProcessInstance;

/// 执行队列中的延迟动作
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum QueuedAction {
    /// 触发下游节点实例
    Trigger {
        node_instance: NodeInstanceId,
        from: Option<TriggerSource>,
        conn_type: String,
    },
    /// 事件开始节点收到事件
    SignalStart {
        node_instance: NodeInstanceId,
        event_type: String,
        payload: Value,
    },
}

impl QueuedAction {
    pub fn node_instance(&self) -> NodeInstanceId {
        match self {
            QueuedAction::Trigger { node_instance, .. } => *node_instance,
            QueuedAction::SignalStart { node_instance, .. } => *node_instance,
        }
    }
}

impl ProcessInstance {
    /// 以独立执行单元运行 `operation`
    ///
    /// 队列模式下压入新队列，执行后排空并弹出。出错时队列中剩余的动作保留，
    /// 由 `execute_pending` 继续执行。递归模式下直接调用。
    pub(crate) fn run_isolated<R, F>(&mut self, operation: F) -> Result<R>
    where
        F: FnOnce(&mut Self) -> Result<R>,
    {
        if !self.is_queue_based() {
            return operation(self);
        }
        self.execution_queues.push(Vec::new());
        let depth = self.execution_queues.len();
        trace!(process_instance = self.id, depth, "execution queue pushed");

        let result = operation(self).and_then(|value| {
            self.drain_queue(depth)?;
            Ok(value)
        });

        if self.execution_queues.len() == depth {
            let keep = result.is_err()
                && self
                    .execution_queues
                    .last()
                    .is_some_and(|queue| !queue.is_empty());
            if !keep {
                self.execution_queues.pop();
                trace!(process_instance = self.id, depth, "execution queue popped");
            }
        }
        result
    }

    /// 放入当前队列
    pub(crate) fn enqueue(&mut self, action: QueuedAction) {
        trace!(
            process_instance = self.id,
            node_instance = action.node_instance(),
            "action enqueued"
        );
        match self.execution_queues.last_mut() {
            Some(queue) => queue.push(action),
            None => self.execution_queues.push(vec![action]),
        }
    }

    /// 后进先出地执行第 `depth` 层队列，直到为空
    fn drain_queue(&mut self, depth: usize) -> Result<()> {
        while let Some(action) = self
            .execution_queues
            .get_mut(depth - 1)
            .and_then(Vec::pop)
        {
            self.execute_action(action)?;
        }
        Ok(())
    }

    /// 从栈顶开始执行所有遗留队列
    pub(crate) fn drain_all(&mut self) -> Result<()> {
        loop {
            let Some(queue) = self.execution_queues.last_mut() else {
                return Ok(());
            };
            match queue.pop() {
                Some(action) => self.execute_action(action)?,
                None => {
                    self.execution_queues.pop();
                }
            }
        }
    }

    /// 目标已不再活动或所在容器已离开活动状态的动作直接丢弃
    fn execute_action(&mut self, action: QueuedAction) -> Result<()> {
        let target = action.node_instance();
        let runnable = self
            .node_instances
            .get(&target)
            .is_some_and(|instance| self.is_container_active(instance.container));
        if !runnable {
            trace!(process_instance = self.id, node_instance = target, "queued action discarded");
            return Ok(());
        }
        match action {
            QueuedAction::Trigger {
                node_instance,
                from,
                conn_type,
            } => self.trigger_node_instance(node_instance, from, &conn_type),
            QueuedAction::SignalStart {
                node_instance,
                event_type,
                payload,
            } => self.signal_start(node_instance, &event_type, &payload),
        }
    }

    /// 挂起中的队列动作数量
    pub fn pending_actions(&self) -> usize {
        self.execution_queues.iter().map(Vec::len).sum()
    }
}
