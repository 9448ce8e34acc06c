// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Smoke tests for the production wiring: config loading through runtime
//! construction and the file-backed session surface.

use arbor_config::Config;
use arbor_core::Runtime;
use arbor_store::SessionStatus;

fn config_with_data_dir(dir: &std::path::Path) -> Config {
    Config { data_dir: Some(dir.to_path_buf()), ..Config::default() }
}

#[tokio::test]
async fn runtime_builds_from_default_config() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_with_data_dir(dir.path());
    let runtime = Runtime::from_config(&cfg).unwrap();

    // The built-in tools are present without any registration.
    let names: Vec<String> =
        runtime.deps().registry.active().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["recall_memory", "store_memory"]);
}

#[tokio::test]
async fn submitted_session_row_persists_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_with_data_dir(dir.path());
    let runtime = Runtime::from_config(&cfg).unwrap();

    let session =
        runtime.submit("say hello", Some("smoke-1".into()), None).await.unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert!(dir.path().join("sessions").join("smoke-1.json").is_file());

    // Duplicate ids are rejected.
    assert!(runtime.submit("again", Some("smoke-1".into()), None).await.is_err());
}

#[tokio::test]
async fn config_yaml_round_trips_through_loader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arbor.yaml");
    std::fs::write(
        &path,
        "agent:\n  max_iterations: 5\nllm:\n  primary:\n    name: deepseek\n",
    )
    .unwrap();
    let cfg = arbor_config::load(Some(&path)).unwrap();
    assert_eq!(cfg.agent.max_iterations, 5);
    assert_eq!(cfg.llm.primary.name, "deepseek");
    assert_eq!(cfg.agent.top_k_tools, 12);
}
