//! Per-call orchestration: defaults, coercion, transform, validation,
//! dispatch (or composite aggregation) and bounding.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use netdash_core::config::{AppConfig, ConfigError};
use netdash_core::error::ToolError;
use reqwest::Method;
use serde_json::{Map, Value, json};

use crate::bounding::{ResponseBoundingEngine, ResponseEnvelope};
use crate::dispatcher::RateLimitedDispatcher;
use crate::policy::PolicyMatcher;
use crate::registry::{CompositeExecutor, OperationKind, ToolDescriptor, ToolRegistry};

const SUGGESTION_MIN_SIMILARITY: f64 = 0.7;

/// Everything a call needs, built once at startup.
#[derive(Debug)]
pub struct EngineContext {
    pub registry: ToolRegistry,
    pub policy: PolicyMatcher,
    pub dispatcher: RateLimitedDispatcher,
    pub bounding: ResponseBoundingEngine,
}

impl EngineContext {
    pub fn from_config(
        config: &AppConfig,
        registry: ToolRegistry,
        token: Option<String>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            registry,
            policy: PolicyMatcher::new(&config.auto_approve, &config.default_params)?,
            dispatcher: RateLimitedDispatcher::new(&config.api, token)?,
            bounding: ResponseBoundingEngine::new(config.bounding.clone()),
        })
    }
}

/// Validated parameters for one call, split along the endpoint template.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Query (GET/DELETE) or body (POST/PUT/PATCH) parameters.
    pub params: Map<String, Value>,
    pub path_params: Map<String, Value>,
    /// Resolved endpoint path; `None` for composite operations.
    pub path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolExecutionEngine {
    ctx: Arc<EngineContext>,
}

impl ToolExecutionEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub async fn invoke(
        &self,
        name: &str,
        params: Map<String, Value>,
    ) -> Result<ResponseEnvelope, ToolError> {
        let Some(descriptor) = self.ctx.registry.get(name) else {
            return Err(ToolError::UnknownTool {
                name: name.to_string(),
                suggestion: suggest_tool(name, self.ctx.registry.names()),
            });
        };
        self.execute(descriptor, params).await
    }

    pub async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        raw: Map<String, Value>,
    ) -> Result<ResponseEnvelope, ToolError> {
        let request = self.prepare(descriptor, raw).inspect_err(|err| {
            tracing::info!(tool = %descriptor.name, error = %err, "tool call rejected");
        })?;

        let payload = match (&descriptor.kind, &request.path) {
            (OperationKind::Http { method, .. }, Some(path)) => {
                let response = self
                    .ctx
                    .dispatcher
                    .submit(method.clone(), path, &request.params)
                    .await?;
                match descriptor.finish {
                    Some(finish) => finish(response.body),
                    None => response.body,
                }
            }
            (OperationKind::Composite(executor), _) => {
                executor
                    .execute(&self.ctx.dispatcher, &request.params)
                    .await?
            }
            (OperationKind::Http { .. }, None) => {
                return Err(ToolError::validation("path", "endpoint path was not resolved"));
            }
        };

        let envelope = self.ctx.bounding.bound(&descriptor.name, payload);
        tracing::debug!(
            tool = %descriptor.name,
            strategy = envelope.strategy.as_str(),
            "tool call completed"
        );
        Ok(envelope)
    }

    /// Runs every pre-network step. An error here guarantees nothing was sent.
    pub fn prepare(
        &self,
        descriptor: &ToolDescriptor,
        raw: Map<String, Value>,
    ) -> Result<RequestEnvelope, ToolError> {
        let mut params: Map<String, Value> = self
            .ctx
            .policy
            .default_params(&descriptor.name)
            .into_iter()
            .filter(|(key, _)| descriptor.schema.declares(key))
            .collect();
        params.extend(raw);

        descriptor.schema.coerce(&mut params);
        if let Some(prepare) = descriptor.prepare {
            prepare(&mut params);
        }
        descriptor.schema.validate(&params)?;
        params.retain(|_, value| !value.is_null());

        match &descriptor.kind {
            OperationKind::Http { path, .. } => {
                let (path, path_params) = resolve_path(path, &mut params)?;
                Ok(RequestEnvelope {
                    params,
                    path_params,
                    path: Some(path),
                })
            }
            OperationKind::Composite(_) => Ok(RequestEnvelope {
                params,
                path_params: Map::new(),
                path: None,
            }),
        }
    }
}

fn suggest_tool<'a>(unknown: &str, known: impl Iterator<Item = &'a str>) -> Option<String> {
    known
        .map(|candidate| (strsim::jaro_winkler(unknown, candidate), candidate))
        .filter(|(score, _)| *score > SUGGESTION_MIN_SIMILARITY)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
        .map(|(_, candidate)| candidate.to_string())
}

/// Substitutes `{name}` placeholders, percent-encoding each value and
/// removing it from `params`.
pub fn resolve_path(
    template: &str,
    params: &mut Map<String, Value>,
) -> Result<(String, Map<String, Value>), ToolError> {
    let mut path = String::with_capacity(template.len());
    let mut consumed = Map::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        path.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            ToolError::validation("path", format!("unterminated placeholder in '{template}'"))
        })?;
        let name = &after[..close];
        let value = match params.remove(name) {
            Some(Value::Null) | None => {
                return Err(ToolError::validation(name, "is required by the endpoint path"));
            }
            Some(value) => value,
        };
        let segment = match &value {
            Value::String(text) if !text.is_empty() => text.clone(),
            Value::Number(number) => number.to_string(),
            _ => {
                return Err(ToolError::validation(
                    name,
                    "path parameters must be non-empty strings or numbers",
                ));
            }
        };
        path.push_str(&urlencoding::encode(&segment));
        consumed.insert(name.to_string(), value);
        rest = &after[close + 1..];
    }
    path.push_str(rest);
    Ok((path, consumed))
}

/// Lists the children of a parent resource, fetches one page of items per
/// child concurrently, and merges them newest first.
///
/// A failing listing call fails the whole operation. A failing child is
/// skipped and reported under `aggregation.skipped`.
#[derive(Debug, Clone)]
pub struct FanOutAggregate {
    /// Template resolved against the caller's parameters, e.g.
    /// `/organizations/{organizationId}/networks`.
    pub list_path: String,
    /// Template with a single `{child_param}` placeholder.
    pub child_path: String,
    pub child_param: String,
    /// Key under which each item records its child's `{id, name}`.
    pub child_kind: String,
    /// Field of a child response holding the items when it is an object.
    pub items_field: Option<String>,
    pub timestamp_field: String,
    pub page_size_param: String,
    pub default_page_size: usize,
}

#[derive(Debug, Clone)]
struct ChildRef {
    id: String,
    name: Value,
}

#[derive(Debug)]
struct TaggedItem {
    child_id: String,
    position: usize,
    timestamp: Option<i64>,
    item: Value,
}

#[async_trait]
impl CompositeExecutor for FanOutAggregate {
    async fn execute(
        &self,
        dispatcher: &RateLimitedDispatcher,
        params: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let mut filters = params.clone();
        let (list_path, _) = resolve_path(&self.list_path, &mut filters)?;
        let listing = dispatcher.submit(Method::GET, &list_path, &Map::new()).await?;
        let children = child_refs(&listing.body);

        let page_size = filters
            .get(&self.page_size_param)
            .and_then(Value::as_u64)
            .map_or(self.default_page_size, |size| size as usize);

        let calls = children.iter().map(|child| {
            let filters = &filters;
            async move {
                let mut child_params = Map::new();
                child_params.insert(self.child_param.clone(), Value::String(child.id.clone()));
                let (path, _) = resolve_path(&self.child_path, &mut child_params)?;
                dispatcher.submit(Method::GET, &path, filters).await
            }
        });
        let results = futures::future::join_all(calls).await;

        let mut merged = Vec::new();
        let mut skipped = Vec::new();
        for (child, result) in children.iter().zip(results) {
            match result {
                Ok(response) => {
                    for (position, item) in self.child_items(response.body).into_iter().enumerate()
                    {
                        merged.push(self.tag(child, position, item));
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        child = %child.id,
                        kind = err.kind(),
                        "skipping child after failed sub-call"
                    );
                    skipped.push(json!({ "id": child.id, "kind": err.kind() }));
                }
            }
        }

        merged.sort_by(compare_newest_first);
        merged.truncate(page_size);

        let total = children.len();
        let succeeded = total - skipped.len();
        let mut result = json!({
            "items": merged.into_iter().map(|tagged| tagged.item).collect::<Vec<_>>(),
            "aggregation": {
                "childrenTotal": total,
                "childrenSucceeded": succeeded,
                "childrenSkipped": skipped.len(),
                "skipped": skipped
            }
        });
        if total > 0 && succeeded == 0 {
            result["warning"] = json!(format!("0 of {total} children succeeded"));
        }
        Ok(result)
    }
}

impl FanOutAggregate {
    fn child_items(&self, body: Value) -> Vec<Value> {
        match (body, &self.items_field) {
            (Value::Array(items), _) => items,
            (Value::Object(mut map), Some(field)) => match map.remove(field) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn tag(&self, child: &ChildRef, position: usize, mut item: Value) -> TaggedItem {
        let timestamp = item.get(&self.timestamp_field).and_then(parse_timestamp);
        if let Value::Object(map) = &mut item {
            map.insert(
                self.child_kind.clone(),
                json!({ "id": child.id, "name": child.name }),
            );
        }
        TaggedItem {
            child_id: child.id.clone(),
            position,
            timestamp,
            item,
        }
    }
}

fn child_refs(body: &Value) -> Vec<ChildRef> {
    let entries = match body {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("items")
            .and_then(Value::as_array)
            .map_or(&[][..], Vec::as_slice),
        _ => &[],
    };
    entries
        .iter()
        .filter_map(|entry| {
            let id = match entry.get("id")? {
                Value::String(id) => id.clone(),
                Value::Number(id) => id.to_string(),
                _ => return None,
            };
            Some(ChildRef {
                id,
                name: entry.get("name").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}

/// Milliseconds since the epoch. Numbers are read as epoch seconds.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.timestamp_millis()),
        Value::Number(number) => number
            .as_f64()
            .filter(|seconds| seconds.is_finite())
            .map(|seconds| (seconds * 1000.0) as i64),
        _ => None,
    }
}

fn compare_newest_first(a: &TaggedItem, b: &TaggedItem) -> Ordering {
    let by_time = match (a.timestamp, b.timestamp) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time
        .then_with(|| a.child_id.cmp(&b.child_id))
        .then_with(|| a.position.cmp(&b.position))
}
