use serde::{Deserialize, Serialize};

use super::compensation::CompensationScopeInstance;
use super::exception::ExceptionScopeInstance;
use super::variables::VariableScopeInstance;
use crate::flow::contexts::{ContextKind, VariableScope};
use crate::flow::types::ContainerDef;

/// 容器持有的上下文实例
///
/// 每种上下文在一个容器内至多一个，首次解析时创建。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextInstances {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variables: Option<VariableScopeInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exception: Option<ExceptionScopeInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compensation: Option<CompensationScopeInstance>,
}

impl ContextInstances {
    pub fn has(&self, kind: ContextKind) -> bool {
        match kind {
            ContextKind::Variable => self.variables.is_some(),
            ContextKind::Exception => self.exception.is_some(),
            ContextKind::Compensation => self.compensation.is_some(),
        }
    }

    pub fn variables(&self) -> Option<&VariableScopeInstance> {
        self.variables.as_ref()
    }

    pub fn variables_or_init(&mut self, scope: Option<&VariableScope>) -> &mut VariableScopeInstance {
        self.variables
            .get_or_insert_with(|| VariableScopeInstance::from_scope(scope))
    }

    pub fn exception(&self) -> Option<&ExceptionScopeInstance> {
        self.exception.as_ref()
    }

    pub fn exception_or_init(&mut self) -> &mut ExceptionScopeInstance {
        self.exception.get_or_insert_with(ExceptionScopeInstance::default)
    }

    pub fn compensation(&self) -> Option<&CompensationScopeInstance> {
        self.compensation.as_ref()
    }

    pub fn compensation_or_init(&mut self, scope: ContainerDef) -> &mut CompensationScopeInstance {
        self.compensation
            .get_or_insert_with(|| CompensationScopeInstance::new(scope))
    }
}
