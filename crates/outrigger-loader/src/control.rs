//! Built-in endpoints for loading and unloading instances at runtime.

use outrigger_plugin_api::{Action, Endpoint, PluginError, PluginResult, Request, Response};
use serde_json::json;
use std::sync::{Arc, Weak};

use crate::loader::Loader;

pub const LIST_PATH: &str = "/agent/plugins";
pub const LOAD_PATH: &str = "/agent/plugins/load";
pub const UNLOAD_PATH: &str = "/agent/plugins/unload";

/// `GET /agent/plugins`, `POST /agent/plugins/load?name=` and
/// `DELETE /agent/plugins/unload?name=`.
pub(crate) fn endpoints(loader: Weak<Loader>, secure: bool) -> Vec<Endpoint> {
    let name_parameter = json!({
        "type": "object",
        "required": ["name"],
        "properties": { "name": { "type": "string" } }
    });

    let list = {
        let loader = loader.clone();
        Endpoint::new(Action::Read, LIST_PATH, move |_request| {
            let loader = loader.clone();
            async move { Response::json(&upgrade(&loader)?.summaries()) }
        })
    };

    let load = {
        let loader = loader.clone();
        Endpoint::new(Action::Create, LOAD_PATH, move |request| {
            let loader = loader.clone();
            async move {
                let name = required_name(&request)?;
                let summary = upgrade(&loader)?.load_by_name(&name).await?;
                Response::json(&summary)
            }
        })
        .with_parameters_schema(name_parameter.clone())
    };

    let unload = Endpoint::new(Action::Delete, UNLOAD_PATH, move |request| {
        let loader = loader.clone();
        async move {
            let name = required_name(&request)?;
            upgrade(&loader)?.unload(&name)?;
            Response::json(&json!({ "unloaded": name }))
        }
    })
    .with_parameters_schema(name_parameter);

    let endpoints = [list, load, unload];
    if secure {
        endpoints.into_iter().map(|e| e.requires_auth(None)).collect()
    } else {
        endpoints.into()
    }
}

fn upgrade(loader: &Weak<Loader>) -> PluginResult<Arc<Loader>> {
    loader
        .upgrade()
        .ok_or_else(|| PluginError::NotFound("loader has shut down".to_string()))
}

fn required_name(request: &Request) -> PluginResult<String> {
    request
        .parameter("name")
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PluginError::InvalidRequest("missing 'name' parameter".to_string()))
}
