//! OpenAPI 3 document built from the live endpoint table.
//!
//! Only descriptors are read; no plugin is called while the document is
//! generated.

use axum::extract::State;
use axum::Json;
use outrigger_plugin_api::{Action, Dispatcher, EndpointDescriptor};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const OPENAPI_PATH: &str = "/api-docs/openapi.json";

/// Builds the document for `endpoints`.
pub fn document<'a>(endpoints: impl IntoIterator<Item = &'a EndpointDescriptor>) -> Value {
    let mut paths = Map::new();
    for descriptor in endpoints {
        let item = paths
            .entry(descriptor.path.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(item) = item {
            item.insert(verb(descriptor.action), operation(descriptor));
        }
    }

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Outrigger Agent API",
            "description": "Endpoints served by the agent and its loaded plugins",
            "version": env!("CARGO_PKG_VERSION"),
            "license": { "name": "MIT OR Apache-2.0" }
        },
        "paths": paths,
        "components": {
            "securitySchemes": {
                "bearerAuth": {
                    "type": "http",
                    "scheme": "bearer",
                    "bearerFormat": "JWT"
                }
            }
        }
    })
}

/// `GET /api-docs/openapi.json`
pub async fn serve(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Value> {
    let endpoints = dispatcher.resolver().endpoints();
    Json(document(endpoints.iter().map(|e| e.descriptor())))
}

fn verb(action: Action) -> String {
    action.http_method().as_str().to_ascii_lowercase()
}

fn operation(descriptor: &EndpointDescriptor) -> Value {
    let mut op = Map::new();
    op.insert(
        "operationId".into(),
        json!(format!("{}{}", descriptor.action, descriptor.path.replace('/', "_"))),
    );

    let mut parameters = Vec::new();
    if let Some(schema) = &descriptor.parameters_schema {
        parameters.extend(schema_parameters(schema, "query"));
    }
    if let Some(schema) = &descriptor.headers_schema {
        parameters.extend(schema_parameters(schema, "header"));
    }
    if !parameters.is_empty() {
        op.insert("parameters".into(), Value::Array(parameters));
    }

    if let Some(schema) = &descriptor.body_schema {
        op.insert(
            "requestBody".into(),
            json!({
                "required": true,
                "content": { "application/json": { "schema": schema } }
            }),
        );
    }

    let mut responses = Map::new();
    let ok = match &descriptor.output_schema {
        Some(schema) => json!({
            "description": "Success",
            "content": { "application/json": { "schema": schema } }
        }),
        None => json!({ "description": "Success" }),
    };
    responses.insert("200".into(), ok);
    responses.insert("404".into(), json!({ "description": "Not found" }));
    responses.insert("503".into(), json!({ "description": "Owning instance has exited" }));

    if descriptor.requires_auth {
        responses.insert("401".into(), json!({ "description": "Unauthorized" }));
        op.insert("security".into(), json!([{ "bearerAuth": [] }]));
        if let Some(group) = &descriptor.auth_group {
            responses.insert("403".into(), json!({ "description": "Forbidden" }));
            op.insert("x-auth-group".into(), json!(group));
        }
    }
    if let Some(schema) = &descriptor.metadata_schema {
        op.insert("x-metadata-schema".into(), schema.clone());
    }

    op.insert("responses".into(), Value::Object(responses));
    Value::Object(op)
}

/// Expands an object schema's properties into OpenAPI parameters.
fn schema_parameters(schema: &Value, location: &str) -> Vec<Value> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };

    properties
        .iter()
        .map(|(name, property)| {
            json!({
                "name": name,
                "in": location,
                "required": required.contains(&name.as_str()),
                "schema": property
            })
        })
        .collect()
}
