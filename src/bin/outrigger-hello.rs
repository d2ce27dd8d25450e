//! Sample plugin.
//!
//! Takes its name from its own file stem, so the same binary installed as
//! `alpha.plugin` and `beta.plugin` runs as two distinct plugins rooted at
//! `/alpha` and `/beta`.

use outrigger_plugin_api::message::META_AUTH_SUBJECT;
use outrigger_plugin_api::{
    async_trait, Action, Endpoint, Plugin, PluginError, PluginHost, PluginResult,
    RegistrationContext, Request, Response,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_NAME: &str = "hello";

struct Hello {
    name: String,
}

impl Hello {
    fn from_exe() -> Self {
        let name = std::env::args()
            .next()
            .and_then(|arg0| {
                Path::new(&arg0)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.split('.').next())
                    .map(str::to_string)
            })
            .filter(|name| !name.is_empty() && !name.starts_with("outrigger-"))
            .unwrap_or_else(|| DEFAULT_NAME.to_string());
        Self { name }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    message: String,
    from: String,
}

#[async_trait]
impl Plugin for Hello {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["greeting".to_string(), "relay".to_string()]
    }

    async fn register(&self, ctx: RegistrationContext) -> PluginResult<Vec<Endpoint>> {
        let greeting = ctx
            .config_value::<String>("greeting")?
            .unwrap_or_else(|| "hello".to_string());
        info!(name = %self.name, greeting = %greeting, "Registering endpoints");

        let hello = {
            let from = self.name.clone();
            Endpoint::new(Action::Read, "/hello", move |req: Request| {
                let body = Greeting {
                    message: format!("{greeting} {}", req.parameter("name").unwrap_or("world")),
                    from: from.clone(),
                };
                async move { Response::json(&body) }
            })
            .with_parameters_schema(json!({
                "type": "object",
                "properties": { "name": { "type": "string" } }
            }))
            .with_output_schema(json!({
                "type": "object",
                "required": ["message", "from"],
                "properties": {
                    "message": { "type": "string" },
                    "from": { "type": "string" }
                }
            }))
        };

        let echo = Endpoint::new(Action::Create, "/echo", |req: Request| async move {
            let mut response = Response::from_bytes(req.body);
            if let Some(content_type) = req.headers.get("content-type").and_then(|v| v.first()) {
                response = response.with_header("content-type", content_type.clone());
            }
            Ok(response)
        });

        let whoami = Endpoint::new(Action::Read, "/whoami", |req: Request| async move {
            let subject = req
                .metadata
                .get(META_AUTH_SUBJECT)
                .cloned()
                .ok_or_else(|| PluginError::Unauthorized("no authenticated subject".into()))?;
            Response::json(&json!({ "subject": subject }))
        })
        .requires_auth(None);

        let relay = {
            let broker = ctx.broker().cloned();
            Endpoint::new(Action::Read, "/relay", move |req: Request| {
                let broker = broker.clone();
                async move {
                    let broker = broker.ok_or_else(|| {
                        PluginError::Unimplemented("the agent did not enable the broker".into())
                    })?;
                    let target = req
                        .parameter("target")
                        .ok_or_else(|| PluginError::InvalidRequest("missing 'target'".into()))?
                        .to_string();
                    let method = req.parameter("method").unwrap_or("/hello").to_string();
                    broker.call(&target, &method, Action::Read, Request::new()).await
                }
            })
            .with_parameters_schema(json!({
                "type": "object",
                "required": ["target"],
                "properties": {
                    "target": { "type": "string" },
                    "method": { "type": "string" }
                }
            }))
        };

        let peers = {
            let broker = ctx.broker().cloned();
            Endpoint::new(Action::Read, "/peers", move |_req: Request| {
                let broker = broker.clone();
                async move {
                    let names = match broker {
                        Some(broker) => broker.list_plugins().await?,
                        None => Vec::new(),
                    };
                    Response::json(&names)
                }
            })
        };

        let exit = Endpoint::new(Action::Create, "/exit", |req: Request| async move {
            let code: i32 = req
                .parameter("code")
                .unwrap_or("0")
                .parse()
                .map_err(|_| PluginError::InvalidRequest("'code' must be an integer".into()))?;
            warn!(code, "Exiting on request");
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::process::exit(code);
            });
            Response::json(&json!({ "exiting": code }))
        });

        let mut endpoints = vec![hello, echo, whoami, relay, peers, exit];
        if ctx.default_secure() {
            endpoints = endpoints
                .into_iter()
                .map(|e| if e.path() == "/exit" { e.requires_auth(None) } else { e })
                .collect();
        }
        Ok(endpoints)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match PluginHost::new(Hello::from_exe()).serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("outrigger-hello: {e}");
            ExitCode::FAILURE
        }
    }
}
