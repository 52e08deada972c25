use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span};

use crate::config::EngineConfig;
use crate::error::{ProcessError, Result};
use crate::flow::registry::ProcessRegistry;
use crate::runtime::environment::ProcessEnvironment;
use crate::runtime::process_instance::{ProcessInstance, ProcessInstanceId, ProcessState};
use crate::runtime::snapshot::ProcessInstanceSnapshot;

/// 工作单元结束状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Committed,
    Failed,
}

/// 工作单元同步回调
pub trait TransactionSynchronization: Send + Sync {
    fn before_completion(&self, _process_instance: ProcessInstanceId) {}
    fn after_completion(&self, _process_instance: ProcessInstanceId, _status: TransactionStatus) {}
}

/// 共享的流程实例句柄
pub type SharedProcessInstance = Arc<Mutex<ProcessInstance>>;

/// 流程会话
///
/// 持有注册表、外部协作者与所有流程实例。每次对实例的操作都在实例锁内完成，
/// 构成一个工作单元，前后通知已注册的同步回调。不同实例之间互不影响。
pub struct ProcessSession {
    registry: Arc<ProcessRegistry>,
    environment: Arc<ProcessEnvironment>,
    config: EngineConfig,
    instances: RwLock<HashMap<ProcessInstanceId, SharedProcessInstance>>,
    next_id: AtomicU64,
    synchronizations: RwLock<Vec<Arc<dyn TransactionSynchronization>>>,
}

impl ProcessSession {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        environment: Arc<ProcessEnvironment>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            environment,
            config,
            instances: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            synchronizations: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn register_synchronization(&self, synchronization: Arc<dyn TransactionSynchronization>) {
        self.synchronizations.write().push(synchronization);
    }

    /// 创建并启动流程实例
    ///
    /// 启动失败时实例仍保留在会话中，故障可通过 `fault()` 查看。
    pub fn start_process(
        &self,
        process_id: &str,
        parameters: BTreeMap<String, Value>,
    ) -> Result<ProcessInstanceId> {
        let definition = self.registry.require(process_id)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let instance = ProcessInstance::new(
            id,
            definition,
            Arc::clone(&self.environment),
            self.config.clone(),
        );
        self.instances
            .write()
            .insert(id, Arc::new(Mutex::new(instance)));
        info!(process_instance = id, process_id, "process instance created");
        self.with_instance(id, |instance| instance.start(parameters))?;
        Ok(id)
    }

    pub fn instance(&self, id: ProcessInstanceId) -> Result<SharedProcessInstance> {
        self.instances
            .read()
            .get(&id)
            .cloned()
            .ok_or(ProcessError::ProcessInstanceNotFound(id))
    }

    pub fn instance_ids(&self) -> Vec<ProcessInstanceId> {
        let mut ids: Vec<_> = self.instances.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 在实例锁内执行一个工作单元
    pub fn with_instance<R, F>(&self, id: ProcessInstanceId, operation: F) -> Result<R>
    where
        F: FnOnce(&mut ProcessInstance) -> Result<R>,
    {
        let shared = self.instance(id)?;
        let _span = info_span!("unit_of_work", process_instance = id).entered();
        let mut instance = shared.lock();
        let synchronizations = self.synchronizations.read().clone();

        let result = operation(&mut instance);
        let status = if result.is_ok() {
            for synchronization in &synchronizations {
                synchronization.before_completion(id);
            }
            TransactionStatus::Committed
        } else {
            TransactionStatus::Failed
        };
        for synchronization in &synchronizations {
            synchronization.after_completion(id, status);
        }
        debug!(process_instance = id, status = ?status, "unit of work finished");
        result
    }

    pub fn signal_event(&self, id: ProcessInstanceId, event_type: &str, payload: Value) -> Result<()> {
        self.with_instance(id, |instance| instance.signal_event(event_type, payload))
    }

    pub fn complete_work_item(
        &self,
        id: ProcessInstanceId,
        work_item: u64,
        results: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.with_instance(id, |instance| instance.complete_work_item(work_item, results))
    }

    pub fn abort_process(&self, id: ProcessInstanceId) -> Result<()> {
        self.with_instance(id, ProcessInstance::abort)
    }

    pub fn state(&self, id: ProcessInstanceId) -> Result<ProcessState> {
        Ok(self.instance(id)?.lock().state())
    }

    pub fn snapshot(&self, id: ProcessInstanceId) -> Result<ProcessInstanceSnapshot> {
        Ok(self.instance(id)?.lock().snapshot())
    }

    /// 从快照恢复实例；同 ID 的现有实例被替换
    pub fn restore(&self, snapshot: ProcessInstanceSnapshot) -> Result<ProcessInstanceId> {
        let definition = self.registry.require(&snapshot.process_id)?;
        let instance = ProcessInstance::restore(snapshot, definition, Arc::clone(&self.environment))?;
        let id = instance.id();
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
        self.instances
            .write()
            .insert(id, Arc::new(Mutex::new(instance)));
        Ok(id)
    }

    /// 移除实例并返回其句柄
    pub fn remove(&self, id: ProcessInstanceId) -> Result<SharedProcessInstance> {
        self.instances
            .write()
            .remove(&id)
            .ok_or(ProcessError::ProcessInstanceNotFound(id))
    }
}

impl std::fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSession")
            .field("config", &self.config)
            .field("instances", &self.instance_ids())
            .field("synchronizations", &self.synchronizations.read().len())
            .finish()
    }
}
