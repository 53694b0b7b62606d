//! Executor Registry: a static, process-wide mapping from [`StageKind`] to a
//! factory that builds the [`StageExecutor`] handling it. Registration
//! happens once during startup (`supervisor::run` binds the built-in kinds)
//! and the registry is read-only from then on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::tool_registry::ToolRegistry;
use crate::types::{ApplicationConfig, ExecutorOutcome, StageKind, WorkspaceHandle};

#[derive(Debug, Error)]
pub enum ExecutorRegistryError {
    #[error("stage kind {0:?} is already registered")]
    AlreadyRegistered(StageKind),
    #[error("no executor registered for stage kind {0:?}")]
    UnknownStage(StageKind),
}

/// Everything a [`StageExecutor`] needs to run one stage invocation.
/// Borrowed rather than owned, since the controller retains ownership of the
/// deployment and application state across the call.
pub struct Input<'a> {
    pub trigger_workspace: &'a WorkspaceHandle,
    pub target_workspace: &'a WorkspaceHandle,
    pub stage_config: &'a serde_json::Value,
    pub app_config: &'a ApplicationConfig,
    pub cancel: &'a CancellationToken,
    pub log: &'a mut dyn FnMut(&str),
    pub tools: &'a ToolRegistry,
    pub tool_base_dir: &'a PathBuf,
}

pub trait StageExecutor: Send + Sync {
    fn execute(&self, input: Input<'_>) -> Result<ExecutorOutcome>;
}

pub trait StageExecutorFactory: Send + Sync {
    fn build(&self) -> Box<dyn StageExecutor>;
}

impl<F> StageExecutorFactory for F
where
    F: Fn() -> Box<dyn StageExecutor> + Send + Sync,
{
    fn build(&self) -> Box<dyn StageExecutor> {
        (self)()
    }
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    factories: Arc<RwLock<HashMap<StageKind, Arc<dyn StageExecutorFactory>>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        kind: StageKind,
        factory: Arc<dyn StageExecutorFactory>,
    ) -> Result<(), ExecutorRegistryError> {
        let mut factories = self.factories.write().expect("executor registry poisoned");
        if factories.contains_key(&kind) {
            return Err(ExecutorRegistryError::AlreadyRegistered(kind));
        }
        factories.insert(kind, factory);
        Ok(())
    }

    pub fn executor_for(&self, kind: StageKind) -> Result<Box<dyn StageExecutor>, ExecutorRegistryError> {
        let factories = self.factories.read().expect("executor registry poisoned");
        factories
            .get(&kind)
            .map(|f| f.build())
            .ok_or(ExecutorRegistryError::UnknownStage(kind))
    }
}
