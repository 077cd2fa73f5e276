//! End-to-end tests over the gRPC surface, backed by the in-memory state
//! store so no etcd, git remote, or cluster is needed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::Code;
use tonic::transport::{Channel, Server};

use hambone::instances::Controller;
use hambone::instances::server::InstancesService;
use hambone::pb;
use hambone::pb::instances_client::InstancesClient;
use hambone::state::memory::MemoryEngine;

struct TestServer {
    client: InstancesClient<Channel>,
    _workdir: TempDir,
}

async fn start_server() -> TestServer {
    let workdir = tempfile::tempdir().unwrap();
    let instances_dir = workdir.path().join("instances");
    let templates_dir = workdir.path().join("templates");
    std::fs::create_dir_all(&templates_dir).unwrap();

    let controller = Arc::new(Controller::new(
        Arc::new(MemoryEngine::new()),
        instances_dir,
        templates_dir,
        false,
        false,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        Server::builder()
            .add_service(pb::instances_server::InstancesServer::new(
                InstancesService::new(controller),
            ))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let mut client = None;
    for _ in 0..20 {
        match InstancesClient::connect(format!("http://{address}")).await {
            Ok(connected) => {
                client = Some(connected);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }

    TestServer {
        client: client.expect("server did not come up"),
        _workdir: workdir,
    }
}

fn kustomization_yaml(name: &str) -> String {
    format!(
        "apiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\nnamePrefix: {name}-\nresources:\n- ../../base\n"
    )
}

fn instance(name: &str) -> pb::Instance {
    pb::Instance {
        name: name.into(),
        kustomization_yaml: kustomization_yaml(name),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_simple_create_and_get() {
    let mut server = start_server().await;

    let returned = server
        .client
        .apply(instance("my-client-1"))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(returned.name, "my-client-1");
    assert!(returned.old_instance.is_none());
    assert_eq!(returned.kustomization_yaml, kustomization_yaml("my-client-1"));

    let list = server
        .client
        .get(pb::GetOptions {
            name: "my-client-1".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(list.instances.len(), 1);
    assert_eq!(list.instances[0].kustomization_yaml, kustomization_yaml("my-client-1"));
}

#[tokio::test]
async fn test_apply_round_trips_files() {
    let mut server = start_server().await;

    let mut wanted = instance("my-client-1");
    wanted.files.push(pb::File {
        relative_path: "my-app/deployment.yaml".into(),
        directory: String::new(),
        contents: "kind: Deployment\n".into(),
    });

    server.client.apply(wanted).await.unwrap();

    let list = server
        .client
        .get(pb::GetOptions {
            name: "my-client-1".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(list.instances[0].files.len(), 1);
    assert_eq!(list.instances[0].files[0].relative_path, "my-app/deployment.yaml");
    assert_eq!(list.instances[0].files[0].directory, "my-app");
    assert_eq!(list.instances[0].files[0].contents, "kind: Deployment\n");
}

#[tokio::test]
async fn test_apply_is_idempotent_without_witness() {
    let mut server = start_server().await;

    server.client.apply(instance("my-client-1")).await.unwrap();
    server.client.apply(instance("my-client-1")).await.unwrap();

    let list = server
        .client
        .get(pb::GetOptions::default())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(list.instances.len(), 1);
}

#[tokio::test]
async fn test_name_prefix_mismatch_is_invalid_argument() {
    let mut server = start_server().await;

    let mut bad = instance("my-client-1");
    bad.kustomization_yaml = "namePrefix: wrong-\n".into();
    let status = server.client.apply(bad).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("my-client-1-"));
    assert!(status.message().contains("wrong-"));
}

#[tokio::test]
async fn test_reserved_file_path_is_invalid_argument() {
    let mut server = start_server().await;

    let mut bad = instance("my-client-1");
    bad.files.push(pb::File {
        relative_path: "kustomization.yaml".into(),
        directory: String::new(),
        contents: String::new(),
    });
    let status = server.client.apply(bad).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_old_instance_name_mismatch_fails_before_store() {
    let mut server = start_server().await;

    let mut subject = instance("my-client-1");
    subject.old_instance = Some(Box::new(instance("my-client-234")));
    let status = server.client.apply(subject).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("do not match"));

    // nothing was stored
    let list = server
        .client
        .get(pb::GetOptions::default())
        .await
        .unwrap()
        .into_inner();
    assert!(list.instances.is_empty());
}

#[tokio::test]
async fn test_cas_update_succeeds_with_matching_witness() {
    let mut server = start_server().await;

    let first = instance("my-client-1");
    server.client.apply(first.clone()).await.unwrap();

    let mut second = instance("my-client-1");
    second.kustomization_yaml = format!("{}namespace: prod\n", kustomization_yaml("my-client-1"));
    second.old_instance = Some(Box::new(first));
    let returned = server.client.apply(second.clone()).await.unwrap().into_inner();
    assert!(returned.old_instance.is_none());

    let list = server
        .client
        .get(pb::GetOptions {
            name: "my-client-1".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(list.instances[0].kustomization_yaml, second.kustomization_yaml);
}

#[tokio::test]
async fn test_cas_update_fails_with_stale_witness() {
    let mut server = start_server().await;

    let first = instance("my-client-1");
    server.client.apply(first.clone()).await.unwrap();

    let mut stale_witness = instance("my-client-1");
    stale_witness.kustomization_yaml =
        format!("{}namespace: dev\n", kustomization_yaml("my-client-1"));
    let mut second = instance("my-client-1");
    second.kustomization_yaml = format!("{}namespace: prod\n", kustomization_yaml("my-client-1"));
    second.old_instance = Some(Box::new(stale_witness));

    let status = server.client.apply(second).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("OldInstance differs"));

    // the store still holds the first version
    let list = server
        .client
        .get(pb::GetOptions {
            name: "my-client-1".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(list.instances[0].kustomization_yaml, first.kustomization_yaml);
}

#[tokio::test]
async fn test_witness_without_stored_instance_fails() {
    let mut server = start_server().await;

    let mut subject = instance("my-client-1");
    subject.old_instance = Some(Box::new(instance("my-client-1")));
    let status = server.client.apply(subject).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("no existing Instance"));
}

#[tokio::test]
async fn test_second_delete_is_not_found() {
    let mut server = start_server().await;

    server.client.apply(instance("my-client-1")).await.unwrap();
    server.client.delete(instance("my-client-1")).await.unwrap();

    let status = server.client.delete(instance("my-client-1")).await.unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let list = server
        .client
        .get(pb::GetOptions {
            name: "my-client-1".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert!(list.instances.is_empty());
}

#[tokio::test]
async fn test_paginated_get() {
    let mut server = start_server().await;

    for index in 0..10 {
        server
            .client
            .apply(instance(&format!("my-client-{index}")))
            .await
            .unwrap();
    }

    let list = server
        .client
        .get(pb::GetOptions {
            start: 2,
            stop: 6,
            exclude_statuses: true,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    let names: Vec<_> = list.instances.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["my-client-1", "my-client-2", "my-client-3", "my-client-4", "my-client-5"]
    );

    // boundary cases: zero bounds mean everything, stop past the end clamps
    let all = server
        .client
        .get(pb::GetOptions::default())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(all.instances.len(), 10);
    let clamped = server
        .client
        .get(pb::GetOptions {
            start: -5,
            stop: 110,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(clamped.instances.len(), 10);

    // a negative stop is an empty window, not "everything"
    let empty = server
        .client
        .get(pb::GetOptions {
            start: 1,
            stop: -3,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert!(empty.instances.is_empty());
}

#[tokio::test]
async fn test_get_templates_walks_template_dirs() {
    let server = start_server().await;
    let mut client = server.client.clone();

    let templates_dir = server._workdir.path().join("templates");
    write_template(&templates_dir, "my-template");
    std::fs::create_dir_all(templates_dir.join("stray")).unwrap();

    let list = client
        .get_templates(pb::GetOptions::default())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(list.instances.len(), 1);
    assert_eq!(list.instances[0].name, "my-template");
    assert_eq!(list.instances[0].files.len(), 1);
}

#[tokio::test]
async fn test_get_templates_by_name() {
    let server = start_server().await;
    let mut client = server.client.clone();

    let templates_dir = server._workdir.path().join("templates");
    write_template(&templates_dir, "my-template");
    std::fs::create_dir_all(templates_dir.join("stray")).unwrap();

    let list = client
        .get_templates(pb::GetOptions {
            name: "my-template".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(list.instances.len(), 1);
    assert_eq!(list.instances[0].name, "my-template");

    // unknown name: empty list
    let list = client
        .get_templates(pb::GetOptions {
            name: "no-such-template".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert!(list.instances.is_empty());

    // a named template without its kustomization file fails instead of
    // being skipped
    let status = client
        .get_templates(pb::GetOptions {
            name: "stray".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("kustomization.yaml"));
}

fn write_template(templates_dir: &Path, name: &str) {
    let dir = templates_dir.join(name);
    std::fs::create_dir_all(dir.join("base")).unwrap();
    std::fs::write(dir.join("kustomization.yaml"), "namePrefix: CHANGE_ME-\n").unwrap();
    std::fs::write(dir.join("base/deployment.yaml"), "kind: Deployment\n").unwrap();
}
