//! Built-in operation catalog for the dashboard API.

use std::sync::Arc;

use reqwest::Method;
use serde_json::{Map, Value, json};

use crate::engine::FanOutAggregate;
use crate::registry::{RegistryError, ToolDescriptor, ToolRegistry};
use crate::schema::{FieldSpec, FieldType, ParamSchema, SchemaError};

/// Look-back window applied to client listings when the caller gives none.
pub const DEFAULT_CLIENT_TIMESPAN_SECS: i64 = 3600;
const MAX_TIMESPAN_SECS: f64 = 2_678_400.0;
const PRODUCT_TYPES: [&str; 6] = [
    "appliance",
    "camera",
    "cellularGateway",
    "switch",
    "systemsManager",
    "wireless",
];

pub fn builtin_registry() -> Result<ToolRegistry, RegistryError> {
    ToolRegistry::from_descriptors(builtin_descriptors()?)
}

pub fn builtin_descriptors() -> Result<Vec<ToolDescriptor>, SchemaError> {
    Ok(vec![
        ToolDescriptor::http(
            "getOrganizations",
            "List the organizations the API key has access to.",
            Method::GET,
            "/organizations",
            ParamSchema::new(vec![per_page(9000)]),
        ),
        ToolDescriptor::http(
            "getOrganizationNetworks",
            "List the networks in an organization.",
            Method::GET,
            "/organizations/{organizationId}/networks",
            ParamSchema::new(vec![
                organization_id(),
                FieldSpec::optional("tags", FieldType::array_of(FieldType::String))
                    .describe("Only networks carrying one of these tags"),
                FieldSpec::optional("productTypes", FieldType::array_of(FieldType::String)),
                per_page(100_000),
            ]),
        ),
        ToolDescriptor::http(
            "getOrganizationDevices",
            "List the devices in an organization.",
            Method::GET,
            "/organizations/{organizationId}/devices",
            ParamSchema::new(vec![
                organization_id(),
                FieldSpec::optional("productTypes", FieldType::array_of(FieldType::String)),
                FieldSpec::optional("networkIds", FieldType::array_of(FieldType::String)),
                FieldSpec::optional("model", FieldType::String),
                per_page(1000),
            ]),
        ),
        ToolDescriptor::http(
            "getNetworkClients",
            "List the clients seen on a network within the look-back window.",
            Method::GET,
            "/networks/{networkId}/clients",
            ParamSchema::new(vec![
                network_id(),
                timespan(),
                per_page(5000),
                FieldSpec::optional("statuses", FieldType::array_of(FieldType::String)),
                FieldSpec::optional("vlan", FieldType::String),
                FieldSpec::optional("mac", FieldType::String)
                    .pattern("(?i)[0-9a-f]{2}(:[0-9a-f]{2}){5}")?
                    .describe("Client MAC address, colon separated"),
            ]),
        )
        .with_prepare(default_timespan),
        ToolDescriptor::http(
            "getDeviceClients",
            "List the clients of a single device.",
            Method::GET,
            "/devices/{serial}/clients",
            ParamSchema::new(vec![serial()?, timespan()]),
        )
        .with_prepare(default_timespan),
        ToolDescriptor::http(
            "getNetworkEvents",
            "List the event log of a network, newest first.",
            Method::GET,
            "/networks/{networkId}/events",
            ParamSchema::new(vec![
                network_id(),
                product_type(),
                FieldSpec::optional("includedEventTypes", FieldType::array_of(FieldType::String)),
                FieldSpec::optional("startingAfter", FieldType::String),
                FieldSpec::optional("endingBefore", FieldType::String),
                per_page(1000),
            ]),
        )
        .with_finish(events_page_to_items),
        ToolDescriptor::composite(
            "getOrganizationNetworkEvents",
            "Merge the newest events of every network in an organization. \
             Networks whose event log cannot be read are skipped and reported.",
            Arc::new(organization_events()),
            ParamSchema::new(vec![
                organization_id(),
                product_type(),
                FieldSpec::optional("includedEventTypes", FieldType::array_of(FieldType::String)),
                per_page(1000).describe("Number of merged events to return (default 10)"),
            ]),
        ),
        ToolDescriptor::http(
            "updateNetwork",
            "Update a network's name, time zone, tags or notes.",
            Method::PUT,
            "/networks/{networkId}",
            ParamSchema::new(vec![
                network_id(),
                FieldSpec::optional("name", FieldType::String).length(Some(1), Some(255)),
                FieldSpec::optional("timeZone", FieldType::String),
                FieldSpec::optional("tags", FieldType::array_of(FieldType::String)),
                FieldSpec::optional("notes", FieldType::String),
            ]),
        ),
        ToolDescriptor::http(
            "rebootDevice",
            "Reboot a device.",
            Method::POST,
            "/devices/{serial}/reboot",
            ParamSchema::new(vec![serial()?]),
        ),
    ])
}

fn organization_events() -> FanOutAggregate {
    FanOutAggregate {
        list_path: "/organizations/{organizationId}/networks".to_string(),
        child_path: "/networks/{networkId}/events".to_string(),
        child_param: "networkId".to_string(),
        child_kind: "network".to_string(),
        items_field: Some("events".to_string()),
        timestamp_field: "occurredAt".to_string(),
        page_size_param: "perPage".to_string(),
        default_page_size: 10,
    }
}

fn organization_id() -> FieldSpec {
    FieldSpec::required("organizationId", FieldType::String).length(Some(1), None)
}

fn network_id() -> FieldSpec {
    FieldSpec::required("networkId", FieldType::String).length(Some(1), None)
}

fn serial() -> Result<FieldSpec, SchemaError> {
    Ok(FieldSpec::required("serial", FieldType::String)
        .pattern("[A-Za-z0-9]{4}-[A-Za-z0-9]{4}-[A-Za-z0-9]{4}")?
        .describe("Device serial, e.g. Q2XX-ABCD-1234"))
}

fn timespan() -> FieldSpec {
    FieldSpec::optional("timespan", FieldType::Integer)
        .range(Some(0.0), Some(MAX_TIMESPAN_SECS))
        .describe("Look-back window in seconds (default 3600)")
}

fn per_page(max: u32) -> FieldSpec {
    FieldSpec::optional("perPage", FieldType::Integer).range(Some(3.0), Some(f64::from(max)))
}

fn product_type() -> FieldSpec {
    FieldSpec::optional("productType", FieldType::String).one_of(PRODUCT_TYPES)
}

fn default_timespan(params: &mut Map<String, Value>) {
    match params.get("timespan") {
        None | Some(Value::Null) => {
            params.insert("timespan".to_string(), json!(DEFAULT_CLIENT_TIMESPAN_SECS));
        }
        Some(_) => {}
    }
}

/// An event page carries its items under `events`; lift them to `items` so
/// large pages are summarized like any other list.
fn events_page_to_items(body: Value) -> Value {
    let Value::Object(mut page) = body else {
        return body;
    };
    let Some(events) = page.remove("events") else {
        return Value::Object(page);
    };
    page.insert("items".to_string(), events);
    Value::Object(page)
}
