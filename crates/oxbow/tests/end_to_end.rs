//! Scenarios against a real backend install. These download Pixi or
//! Micromamba and solve real environments, so they only run when asked for
//! explicitly (`cargo test -- --ignored`) with a built worker program
//! available through `OXBOW_WORKER`.

#![cfg(unix)]

use std::path::PathBuf;

use oxbow::{Backend, Dependencies, Manager, ManagerOptions, PlatformCommands};
use serde_json::{Map, json};

const NUMPY_MODULE: &str = "import numpy as np

def s(x):
    return int(np.sum(x))

def prod(x=[], y=1):
    return int(np.prod(x)) * y
";

fn scratch_manager(dir: &tempfile::TempDir) -> Manager {
    Manager::new(ManagerOptions {
        instance_dir: dir.path().join("instance"),
        backend_root: Some(dir.path().join("pixi")),
        backend: Some(Backend::Pixi),
        ..Default::default()
    })
    .unwrap()
}

fn numpy_deps() -> Dependencies {
    Dependencies {
        conda: vec!["numpy".into()],
        ..Default::default()
    }
}

fn write_module(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("m.py");
    fs_err::write(&path, NUMPY_MODULE).unwrap();
    path
}

#[tokio::test]
#[ignore = "requires network access to install the backend and a worker program in OXBOW_WORKER"]
async fn numeric_round_trip_via_execute() {
    let dir = tempfile::tempdir().unwrap();
    let manager = scratch_manager(&dir);
    let module = write_module(&dir);

    let environment = manager
        .create("numpy-e2e", numpy_deps(), &PlatformCommands::default(), true)
        .await
        .unwrap();
    environment
        .launch(&PlatformCommands::default(), None)
        .await
        .unwrap();

    let result = environment
        .execute(&module, "s", vec![json!([1, 2, 3])], Map::new())
        .await
        .unwrap();
    assert_eq!(result, Some(json!(6)));

    let mut kwargs = Map::new();
    kwargs.insert("y".to_string(), json!(2));
    let result = environment
        .execute(&module, "prod", vec![json!([1, 2, 3])], kwargs)
        .await
        .unwrap();
    assert_eq!(result, Some(json!(12)));

    environment.exit().await.unwrap();
}

#[tokio::test]
#[ignore = "requires network access to install the backend and a worker program in OXBOW_WORKER"]
async fn missing_function_reports_has_no_function() {
    let dir = tempfile::tempdir().unwrap();
    let manager = scratch_manager(&dir);
    let module = write_module(&dir);

    let environment = manager
        .create("numpy-missing", numpy_deps(), &PlatformCommands::default(), true)
        .await
        .unwrap();
    environment
        .launch(&PlatformCommands::default(), None)
        .await
        .unwrap();

    let err = environment
        .execute(&module, "does_not_exist", vec![], Map::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("has no function"));

    environment.exit().await.unwrap();
}

#[tokio::test]
#[ignore = "requires network access to install the backend and a worker program in OXBOW_WORKER"]
async fn exiting_and_recreating_yields_a_fresh_worker() {
    let dir = tempfile::tempdir().unwrap();
    let manager = scratch_manager(&dir);

    let environment = manager
        .create("respawn", numpy_deps(), &PlatformCommands::default(), true)
        .await
        .unwrap();
    environment
        .launch(&PlatformCommands::default(), None)
        .await
        .unwrap();
    let first_port = environment.as_external().unwrap().port().await;

    environment.exit().await.unwrap();
    assert!(!environment.launched().await);

    let environment = manager
        .create("respawn", numpy_deps(), &PlatformCommands::default(), true)
        .await
        .unwrap();
    environment
        .launch(&PlatformCommands::default(), None)
        .await
        .unwrap();
    let second_port = environment.as_external().unwrap().port().await;

    assert!(first_port.is_some() && second_port.is_some());
    environment.exit().await.unwrap();
}
