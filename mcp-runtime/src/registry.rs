use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use netdash_core::error::ToolError;
use reqwest::Method;
use serde_json::{Map, Value};

use crate::dispatcher::RateLimitedDispatcher;
use crate::schema::{ParamSchema, SchemaError};

/// Pre-validation hook: may add, remove or rewrite parameters.
pub type PrepareHook = fn(&mut Map<String, Value>);

/// Post-response hook applied to the raw upstream payload before bounding.
pub type FinishHook = fn(Value) -> Value;

/// An operation that issues several upstream calls and merges the results.
#[async_trait]
pub trait CompositeExecutor: Send + Sync {
    async fn execute(
        &self,
        dispatcher: &RateLimitedDispatcher,
        params: &Map<String, Value>,
    ) -> Result<Value, ToolError>;
}

#[derive(Clone)]
pub enum OperationKind {
    Http { method: Method, path: String },
    Composite(Arc<dyn CompositeExecutor>),
}

impl std::fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Http { method, path } => f
                .debug_struct("Http")
                .field("method", method)
                .field("path", path)
                .finish(),
            OperationKind::Composite(_) => f.write_str("Composite"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub kind: OperationKind,
    pub schema: ParamSchema,
    pub prepare: Option<PrepareHook>,
    pub finish: Option<FinishHook>,
}

impl ToolDescriptor {
    pub fn http(
        name: impl Into<String>,
        description: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        schema: ParamSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: OperationKind::Http {
                method,
                path: path.into(),
            },
            schema,
            prepare: None,
            finish: None,
        }
    }

    pub fn composite(
        name: impl Into<String>,
        description: impl Into<String>,
        executor: Arc<dyn CompositeExecutor>,
        schema: ParamSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: OperationKind::Composite(executor),
            schema,
            prepare: None,
            finish: None,
        }
    }

    pub fn with_prepare(mut self, hook: PrepareHook) -> Self {
        self.prepare = Some(hook);
        self
    }

    pub fn with_finish(mut self, hook: FinishHook) -> Self {
        self.finish = Some(hook);
        self
    }

    /// Mutating verbs are never advertised as read-only, whatever the name.
    pub fn is_read_only(&self) -> bool {
        match &self.kind {
            OperationKind::Http { method, .. } => *method == Method::GET,
            OperationKind::Composite(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Immutable once the engine context is built. Iteration follows
/// registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ToolDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }
        self.index.insert(descriptor.name.clone(), self.tools.len());
        self.tools.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&slot| &self.tools[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|tool| tool.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
