//! End-to-end scenarios that launch the sample plugin as a real child process.
#![cfg(unix)]

mod common;

use common::{install, loader, loader_settings, sha1_hex};
use outrigger_core::PluginConfig;
use outrigger_loader::instance::SIGNALLED_EXIT_CODE;
use outrigger_loader::{Broker, Loader};
use outrigger_plugin_api::host::ENV_PLUGIN_COOKIE;
use outrigger_plugin_api::standalone::ENV_STANDALONE_PROTOCOL;
use outrigger_plugin_api::{
    Action, Dispatcher, EndpointDescriptor, PluginError, Request,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn dispatcher(loader: &Arc<Loader>) -> Dispatcher {
    Dispatcher::new(loader.clone())
}

#[tokio::test]
async fn test_load_verified_plugin_and_call_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = install(dir.path(), "alpha.plugin");

    let mut entry = PluginConfig::new("alpha.plugin");
    entry.hash = Some(sha1_hex(&path));
    entry.config.insert("greeting".to_string(), json!("hi"));
    let loader = loader(dir.path(), vec![entry]);

    let loaded = loader.initialize(false).await.unwrap();
    assert_eq!(loaded, vec!["alpha"]);

    let response = dispatcher(&loader)
        .dispatch(
            Action::Read,
            "/alpha/hello",
            Request::new().with_parameter("name", "tests"),
        )
        .await
        .unwrap();
    let body: Value = response.parse_value().unwrap();
    assert_eq!(body["message"], "hi tests");
    assert_eq!(body["from"], "alpha");

    let summary = loader.instance("alpha").unwrap().summary();
    assert_eq!(summary.module_type, "plugin");
    assert!(summary.capabilities.contains(&"relay".to_string()));
    assert!(summary.registered);

    loader.close_all(Duration::from_secs(5)).await;
    assert!(loader.instance_names().is_empty());
}

#[tokio::test]
async fn test_hash_mismatch_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    install(dir.path(), "alpha.plugin");
    let beta = install(dir.path(), "beta.plugin");

    let mut tampered = PluginConfig::new("alpha.plugin");
    tampered.hash = Some("0".repeat(40));
    let mut verified = PluginConfig::new("beta.plugin");
    verified.hash = Some(sha1_hex(&beta));
    let loader = loader(dir.path(), vec![tampered, verified]);

    let loaded = loader.initialize(false).await.unwrap();
    assert_eq!(loaded, vec!["beta"]);
    assert!(loader.instance("alpha").is_none());
    assert!(matches!(
        dispatcher(&loader)
            .dispatch(Action::Read, "/alpha/hello", Request::new())
            .await,
        Err(PluginError::NotFound(_))
    ));

    loader.close_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_unconfigured_binaries_need_opt_in() {
    let dir = tempfile::tempdir().unwrap();
    install(dir.path(), "alpha.plugin");

    let strict = loader(dir.path(), Vec::new());
    assert!(strict.initialize(false).await.unwrap().is_empty());

    let settings = outrigger_core::config::LoaderConfig {
        load_unconfigured: true,
        ..loader_settings(dir.path())
    };
    let permissive = Loader::new(&settings, Vec::new(), Vec::new(), None);
    assert_eq!(permissive.initialize(false).await.unwrap(), vec!["alpha"]);
    permissive.close_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_broker_relays_between_plugins() {
    let dir = tempfile::tempdir().unwrap();
    install(dir.path(), "alpha.plugin");
    install(dir.path(), "beta.plugin");

    let settings = outrigger_core::config::LoaderConfig {
        load_unconfigured: true,
        broker_enabled: true,
        ..loader_settings(dir.path())
    };
    let loader = Loader::new(&settings, Vec::new(), Vec::new(), None);
    Broker::new(loader.clone()).start().await.unwrap();

    let mut loaded = loader.initialize(false).await.unwrap();
    loaded.sort();
    assert_eq!(loaded, vec!["alpha", "beta"]);

    let d = dispatcher(&loader);
    let relayed = d
        .dispatch(
            Action::Read,
            "/alpha/relay",
            Request::new().with_parameter("target", "beta"),
        )
        .await
        .unwrap();
    let body: Value = relayed.parse_value().unwrap();
    assert_eq!(body["from"], "beta");

    let peers: Vec<String> = d
        .dispatch(Action::Read, "/beta/peers", Request::new())
        .await
        .unwrap()
        .parse_value()
        .unwrap();
    assert_eq!(peers, vec!["alpha", "beta"]);

    let missing = d
        .dispatch(
            Action::Read,
            "/alpha/relay",
            Request::new().with_parameter("target", "ghost"),
        )
        .await;
    assert!(matches!(missing, Err(PluginError::NotFound(_))));

    loader.close_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_exited_plugin_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    install(dir.path(), "alpha.plugin");
    let settings = outrigger_core::config::LoaderConfig {
        load_unconfigured: true,
        ..loader_settings(dir.path())
    };
    let loader = Loader::new(&settings, Vec::new(), Vec::new(), None);
    loader.initialize(false).await.unwrap();
    let instance = loader.instance("alpha").unwrap();

    loader
        .call_shim(
            &EndpointDescriptor::new(Action::Create, "/alpha/exit"),
            Request::new().with_parameter("code", "3"),
        )
        .await
        .unwrap();
    let code = tokio::time::timeout(Duration::from_secs(10), instance.exited())
        .await
        .unwrap();
    assert_eq!(code, 3);

    let result = dispatcher(&loader)
        .dispatch(Action::Read, "/alpha/hello", Request::new())
        .await;
    assert!(matches!(
        result,
        Err(PluginError::InstanceExited { exit_code: 3, .. })
    ));

    loader.close_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_unload_kills_child_and_removes_routes() {
    let dir = tempfile::tempdir().unwrap();
    install(dir.path(), "alpha.plugin");
    let settings = outrigger_core::config::LoaderConfig {
        load_unconfigured: true,
        ..loader_settings(dir.path())
    };
    let loader = Loader::new(&settings, Vec::new(), Vec::new(), None);
    loader.initialize(false).await.unwrap();
    let instance = loader.instance("alpha").unwrap();

    loader.unload("alpha").unwrap();
    let code = tokio::time::timeout(Duration::from_secs(10), instance.exited())
        .await
        .unwrap();
    assert_eq!(code, SIGNALLED_EXIT_CODE);
    assert!(loader.route(Action::Read, "/alpha/hello").is_none());

    // The control endpoint brings it back.
    let summary = loader.load_by_name("alpha").await.unwrap();
    assert_eq!(summary.name, "alpha");
    assert!(loader.route(Action::Read, "/alpha/hello").is_some());

    loader.close_all(Duration::from_secs(5)).await;
}

#[test]
fn test_direct_execution_is_refused() {
    let output = std::process::Command::new(common::hello_binary())
        .env_remove(ENV_PLUGIN_COOKIE)
        .env_remove(ENV_STANDALONE_PROTOCOL)
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Not launched by the outrigger host"), "{stderr}");
}
