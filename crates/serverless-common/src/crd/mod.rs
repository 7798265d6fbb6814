//! Custom Resource Definitions for the function controller

mod condition;
mod function;

pub use condition::{
    condition_reason, condition_status, equal_conditions, update_condition, Condition,
    ConditionReason, ConditionStatus, ConditionType,
};
pub use function::{
    Function, FunctionSource, FunctionSpec, FunctionStatus, GitRepositorySource, InlineSource,
    RepositoryAuth, RepositoryAuthType, ResourceConfiguration, Runtime, ScaleConfig, SecretMount,
    SourceType,
};
