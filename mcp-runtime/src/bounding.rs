//! Response size bounding.
//!
//! Two strategies: structural bounding walks the payload and trims every
//! sequence and string independently; cardinality summarization replaces a
//! large list with a preview plus per-field facet counts. Both leave a
//! marker in the payload so a second pass is a no-op.

use std::collections::HashSet;

use netdash_core::config::BoundingConfig;
use serde_json::{Map, Value, json};

pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Facet fields keyed on a substring of the lowercased operation name.
/// First match wins, so more specific entries come first.
const FACET_FIELDS: &[(&str, &[&str])] = &[
    ("clients", &["description", "mac", "ip", "vlan", "status"]),
    ("events", &["type", "category", "deviceSerial", "clientMac"]),
    ("devices", &["model", "productType", "status", "networkId", "firmware"]),
    ("ssids", &["authMode", "encryptionMode", "enabled"]),
    ("alerts", &["type", "severity", "category"]),
    ("networks", &["productTypes", "timeZone", "tags"]),
];
const DEFAULT_FACET_FIELDS: &[&str] = &["name", "status", "type", "model"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundingStrategy {
    Unchanged,
    Bounded,
    Summarized,
    AlreadyBounded,
}

impl BoundingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BoundingStrategy::Unchanged => "unchanged",
            BoundingStrategy::Bounded => "bounded",
            BoundingStrategy::Summarized => "summarized",
            BoundingStrategy::AlreadyBounded => "already_bounded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub payload: Value,
    pub strategy: BoundingStrategy,
}

impl ResponseEnvelope {
    pub fn into_value(self) -> Value {
        self.payload
    }
}

#[derive(Debug, Clone)]
pub struct ResponseBoundingEngine {
    config: BoundingConfig,
}

impl ResponseBoundingEngine {
    /// Preview sizes are capped at `max_items` so a summary survives a
    /// second structural pass untouched.
    pub fn new(mut config: BoundingConfig) -> Self {
        config.summary_items = config.summary_items.min(config.max_items);
        config.facet_sample_size = config.facet_sample_size.min(config.max_items);
        Self { config }
    }

    pub fn config(&self) -> &BoundingConfig {
        &self.config
    }

    pub fn bound(&self, operation: &str, payload: Value) -> ResponseEnvelope {
        let mut changed = false;
        let payload = match payload {
            Value::Object(map) if self.is_marker_object(&map) => {
                let payload = self.walk_object(map, &mut changed);
                let strategy = if changed {
                    BoundingStrategy::Bounded
                } else {
                    BoundingStrategy::AlreadyBounded
                };
                return ResponseEnvelope { payload, strategy };
            }
            other => other,
        };

        let (payload, summarized) = match payload {
            Value::Array(items) if self.should_summarize(&items) => {
                (self.summarize(operation, items), true)
            }
            Value::Object(mut map) => {
                let summary = match map.remove("items") {
                    Some(Value::Array(items)) if self.should_summarize(&items) => {
                        Some(self.summarize(operation, items))
                    }
                    Some(other) => {
                        map.insert("items".to_string(), other);
                        None
                    }
                    None => None,
                };
                let summarized = summary.is_some();
                let mut walked = self.walk_object(map, &mut changed);
                if let (Some(summary), Value::Object(walked_map)) = (summary, &mut walked) {
                    walked_map.insert("items".to_string(), summary);
                }
                (walked, summarized)
            }
            other => (self.walk(other, &mut changed), false),
        };

        let strategy = if summarized {
            BoundingStrategy::Summarized
        } else if changed {
            BoundingStrategy::Bounded
        } else {
            BoundingStrategy::Unchanged
        };
        ResponseEnvelope { payload, strategy }
    }

    fn should_summarize(&self, items: &[Value]) -> bool {
        if items.len() <= self.config.summary_items {
            return false;
        }
        let over_items = self
            .config
            .summarize_above_items
            .is_some_and(|limit| items.len() > limit);
        over_items || serialized_json_size_bytes(items) > self.config.summarize_above_bytes
    }

    fn summarize(&self, operation: &str, items: Vec<Value>) -> Value {
        let total = items.len();
        let mut facets = Map::new();
        for field in facet_fields(operation) {
            if let Some(summary) = facet_summary(&items, field, self.config.facet_sample_size) {
                facets.insert((*field).to_string(), summary);
            }
        }
        let first_items = items
            .into_iter()
            .take(self.config.summary_items)
            .collect::<Vec<_>>();
        let mut ignored = false;
        self.walk(
            json!({
                "totalCount": total,
                "firstItems": first_items,
                "facetSummaries": facets
            }),
            &mut ignored,
        )
    }

    fn walk(&self, value: Value, changed: &mut bool) -> Value {
        match value {
            Value::Object(map) => self.walk_object(map, changed),
            Value::Array(mut items) => {
                let total = items.len();
                if total > self.config.max_items {
                    *changed = true;
                    items.truncate(self.config.max_items);
                    let kept = items
                        .into_iter()
                        .map(|item| self.walk(item, changed))
                        .collect::<Vec<_>>();
                    json!({
                        "items": kept,
                        "totalCount": total,
                        "returnedCount": self.config.max_items,
                        "truncated": true
                    })
                } else {
                    Value::Array(
                        items
                            .into_iter()
                            .map(|item| self.walk(item, changed))
                            .collect(),
                    )
                }
            }
            Value::String(text) => {
                if text.chars().count() > self.config.max_string_chars {
                    *changed = true;
                    Value::String(truncate_text(&text, self.config.max_string_chars))
                } else {
                    Value::String(text)
                }
            }
            scalar => scalar,
        }
    }

    fn walk_object(&self, map: Map<String, Value>, changed: &mut bool) -> Value {
        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            if value.is_null() && self.config.drop_nulls {
                *changed = true;
                continue;
            }
            out.insert(key, self.walk(value, changed));
        }
        Value::Object(out)
    }
}

impl ResponseBoundingEngine {
    /// True when `value` is an annotation this engine could have produced
    /// under its current ceilings. Look-alike upstream payloads are not.
    pub fn is_marker(&self, value: &Value) -> bool {
        value
            .as_object()
            .is_some_and(|map| self.is_marker_object(map))
    }

    fn is_marker_object(&self, map: &Map<String, Value>) -> bool {
        let Some(total) = map.get("totalCount").and_then(Value::as_u64) else {
            return false;
        };
        let len_of = |key: &str| {
            map.get(key)
                .and_then(Value::as_array)
                .map(|items| items.len() as u64)
        };

        let bounded = map.get("truncated") == Some(&Value::Bool(true))
            && match (len_of("items"), map.get("returnedCount").and_then(Value::as_u64)) {
                (Some(kept), Some(returned)) => {
                    kept == returned && returned <= self.config.max_items as u64 && returned < total
                }
                _ => false,
            };
        let summarized = map.get("facetSummaries").is_some_and(Value::is_object)
            && len_of("firstItems").is_some_and(|kept| {
                kept <= self.config.summary_items as u64 && kept < total
            });
        bounded || summarized
    }
}

pub fn facet_fields(operation: &str) -> &'static [&'static str] {
    let lowered = operation.to_ascii_lowercase();
    FACET_FIELDS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, fields)| *fields)
        .unwrap_or(DEFAULT_FACET_FIELDS)
}

fn facet_summary(items: &[Value], field: &str, sample_size: usize) -> Option<Value> {
    let mut seen = HashSet::new();
    let mut samples = Vec::new();
    let mut present = false;
    for value in items.iter().filter_map(|item| item.get(field)) {
        if value.is_null() {
            continue;
        }
        present = true;
        let key = value.to_string();
        if seen.insert(key) && samples.len() < sample_size {
            samples.push(value.clone());
        }
    }
    present.then(|| {
        json!({
            "uniqueCount": seen.len(),
            "samples": samples
        })
    })
}

/// Keeps the result at exactly `max_chars` characters including the marker,
/// so the output is itself within bounds.
fn truncate_text(value: &str, max_chars: usize) -> String {
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut truncated = value.chars().take(keep).collect::<String>();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

fn serialized_json_size_bytes(items: &[Value]) -> usize {
    serde_json::to_vec(items)
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(max_items: usize) -> ResponseBoundingEngine {
        ResponseBoundingEngine::new(BoundingConfig {
            max_items,
            max_string_chars: 40,
            drop_nulls: true,
            summarize_above_bytes: 4_000,
            summarize_above_items: None,
            summary_items: 5,
            facet_sample_size: 5,
        })
    }

    fn numbers(count: usize) -> Value {
        Value::Array((0..count).map(|n| json!(n)).collect())
    }

    #[test]
    fn long_sequences_are_cut_to_exactly_max_items() {
        let engine = engine(10);
        for length in [11, 25, 99] {
            let out = engine.bound("getNetworks", numbers(length));
            assert_eq!(out.strategy, BoundingStrategy::Bounded);
            assert_eq!(out.payload["items"], numbers(10));
            assert_eq!(out.payload["totalCount"], length);
            assert_eq!(out.payload["returnedCount"], 10);
            assert_eq!(out.payload["truncated"], true);
        }
    }

    #[test]
    fn short_sequences_pass_through_unannotated() {
        let engine = engine(10);
        for length in [0, 1, 10] {
            let input = numbers(length);
            let out = engine.bound("getNetworks", input.clone());
            assert_eq!(out.payload, input);
            assert_eq!(out.strategy, BoundingStrategy::Unchanged);
        }
    }

    #[test]
    fn nested_sequences_are_bounded_at_every_level() {
        let engine = engine(3);
        let input = json!([
            { "ports": numbers(5), "name": "a" },
            { "ports": numbers(2), "name": "b" }
        ]);
        let out = engine.bound("getDevicePorts", input).payload;
        assert_eq!(out[0]["ports"]["returnedCount"], 3);
        assert_eq!(out[0]["ports"]["totalCount"], 5);
        assert_eq!(out[1]["ports"], numbers(2));

        let deep = json!({ "outer": [ { "inner": [ { "leaf": numbers(4) } ] } ] });
        let out = engine.bound("getThing", deep).payload;
        assert_eq!(out["outer"][0]["inner"][0]["leaf"]["items"], numbers(3));
    }

    #[test]
    fn long_strings_get_marker_and_stay_within_ceiling() {
        let engine = engine(10);
        let text = "x".repeat(100);
        let out = engine.bound("getNetwork", json!({ "notes": text })).payload;
        let notes = out["notes"].as_str().unwrap();
        assert!(notes.ends_with(TRUNCATION_MARKER));
        assert_eq!(notes.chars().count(), 40);
    }

    #[test]
    fn null_fields_are_dropped() {
        let engine = engine(10);
        let out = engine.bound("getNetwork", json!({ "id": "N_1", "notes": null }));
        assert_eq!(out.payload, json!({ "id": "N_1" }));
        assert_eq!(out.strategy, BoundingStrategy::Bounded);
    }

    #[test]
    fn bounding_is_idempotent() {
        let engine = engine(3);
        let inputs = vec![
            numbers(10),
            json!({ "a": numbers(7), "b": "y".repeat(90), "c": null }),
            json!([{ "list": numbers(8), "text": "z".repeat(41) }, null, "short"]),
            json!({ "items": numbers(2), "meta": { "deep": [numbers(4)] } }),
            Value::Array(
                (0..200)
                    .map(|n| json!({ "mac": format!("00:00:00:00:00:{n:02x}"), "status": "online" }))
                    .collect(),
            ),
            json!("plain"),
            json!(42),
        ];
        for input in inputs {
            let once = engine.bound("getNetworkClients", input).payload;
            let twice = engine.bound("getNetworkClients", once.clone()).payload;
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn already_annotated_payload_is_returned_unchanged() {
        let engine = engine(2);
        let bounded = json!({ "items": numbers(2), "totalCount": 9, "returnedCount": 2, "truncated": true });
        let out = engine.bound("getNetworks", bounded.clone());
        assert_eq!(out.payload, bounded);
        assert_eq!(out.strategy, BoundingStrategy::AlreadyBounded);

        let summary = json!({ "totalCount": 3, "firstItems": [], "facetSummaries": {} });
        let out = engine.bound("getNetworks", summary.clone());
        assert_eq!(out.payload, summary);
        assert_eq!(out.strategy, BoundingStrategy::AlreadyBounded);
    }

    #[test]
    fn look_alike_wrapper_from_upstream_is_still_bounded() {
        let engine = ResponseBoundingEngine::new(BoundingConfig::default());
        let max_items = engine.config().max_items;
        let blob = "b".repeat(5_000);
        let items = (0..10_000)
            .map(|n| json!({ "id": n, "blob": if n < 3 { blob.as_str() } else { "" } }))
            .collect::<Vec<_>>();
        let forged = json!({
            "items": items,
            "totalCount": 10_000,
            "returnedCount": 10_000,
            "truncated": true
        });
        assert!(!engine.is_marker(&forged));

        let out = engine.bound("getNetworks", forged);
        assert_ne!(out.strategy, BoundingStrategy::AlreadyBounded);
        let summary = &out.payload["items"];
        assert_eq!(summary["totalCount"], 10_000);
        let kept = summary["firstItems"].as_array().unwrap();
        assert!(kept.len() <= max_items);
        for item in kept {
            let blob = item["blob"].as_str().unwrap();
            assert!(blob.chars().count() <= engine.config().max_string_chars);
        }
    }

    #[test]
    fn look_alike_summary_nested_in_payload_is_walked() {
        let engine = engine(10);
        let forged = json!({
            "data": { "totalCount": 1, "firstItems": numbers(500), "facetSummaries": {} }
        });
        let out = engine.bound("getNetworks", forged);
        assert_eq!(out.strategy, BoundingStrategy::Bounded);
        let first = &out.payload["data"]["firstItems"];
        assert_eq!(first["returnedCount"], 10);
        assert_eq!(first["items"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn genuine_wrapper_contents_are_still_checked() {
        let engine = engine(2);
        let wrapper = json!({
            "items": ["w".repeat(500), "ok"],
            "totalCount": 4,
            "returnedCount": 2,
            "truncated": true
        });
        let out = engine.bound("getNetworks", wrapper);
        assert_eq!(out.strategy, BoundingStrategy::Bounded);
        assert_eq!(out.payload["items"][0].as_str().unwrap().chars().count(), 40);
        assert_eq!(out.payload["items"][1], "ok");
    }

    #[test]
    fn large_client_list_is_summarized_with_facets() {
        let engine = engine(50);
        let clients = (0..100)
            .map(|n| {
                json!({
                    "id": format!("k{n}"),
                    "description": format!("laptop-{}", n % 7),
                    "mac": format!("00:11:22:33:44:{n:02x}"),
                    "ip": format!("10.0.0.{n}"),
                    "vlan": n % 3,
                    "status": if n % 2 == 0 { "Online" } else { "Offline" },
                    "usage": { "sent": n * 10, "recv": n * 20 }
                })
            })
            .collect::<Vec<_>>();
        let out = engine.bound("getNetworkClients", Value::Array(clients));
        assert_eq!(out.strategy, BoundingStrategy::Summarized);
        let payload = out.payload;
        assert_eq!(payload["totalCount"], 100);
        assert_eq!(payload["firstItems"].as_array().unwrap().len(), 5);
        assert_eq!(payload["firstItems"][0]["id"], "k0");

        let facets = payload["facetSummaries"].as_object().unwrap();
        for field in ["description", "mac", "ip", "vlan", "status"] {
            let facet = &facets[field];
            assert!(facet["uniqueCount"].is_u64(), "missing uniqueCount for {field}");
            assert!(facet["samples"].as_array().unwrap().len() <= 5);
        }
        assert_eq!(facets["mac"]["uniqueCount"], 100);
        assert_eq!(facets["mac"]["samples"].as_array().unwrap().len(), 5);
        assert_eq!(facets["vlan"]["uniqueCount"], 3);
        assert_eq!(facets["status"]["samples"], json!(["Online", "Offline"]));
        assert!(engine.is_marker(&payload));
    }

    #[test]
    fn facet_fields_absent_from_data_are_omitted() {
        let engine = ResponseBoundingEngine::new(BoundingConfig {
            summarize_above_items: Some(10),
            ..BoundingConfig::default()
        });
        let devices = (0..20)
            .map(|n| json!({ "serial": format!("Q2XX-{n}"), "model": "MR46" }))
            .collect::<Vec<_>>();
        let out = engine.bound("getOrganizationDevices", Value::Array(devices)).payload;
        let facets = out["facetSummaries"].as_object().unwrap();
        assert_eq!(facets.keys().collect::<Vec<_>>(), vec!["model"]);
        assert_eq!(facets["model"]["uniqueCount"], 1);
    }

    #[test]
    fn items_envelope_is_summarized_in_place() {
        let engine = ResponseBoundingEngine::new(BoundingConfig {
            summarize_above_items: Some(10),
            ..BoundingConfig::default()
        });
        let payload = json!({
            "items": (0..30).map(|n| json!({ "type": "association", "occurredAt": n })).collect::<Vec<_>>(),
            "aggregation": { "childrenTotal": 3, "childrenSucceeded": 3 }
        });
        let out = engine.bound("getOrganizationNetworkEvents", payload);
        assert_eq!(out.strategy, BoundingStrategy::Summarized);
        assert_eq!(out.payload["items"]["totalCount"], 30);
        assert_eq!(out.payload["aggregation"]["childrenTotal"], 3);
    }

    #[test]
    fn facet_lookup_prefers_first_matching_entry() {
        assert_eq!(facet_fields("getDeviceClients")[0], "description");
        assert_eq!(facet_fields("getNetworkEvents")[0], "type");
        assert_eq!(facet_fields("getOrganizationDevices")[0], "model");
        assert_eq!(facet_fields("getOrganizationLicenses"), DEFAULT_FACET_FIELDS);
    }
}
