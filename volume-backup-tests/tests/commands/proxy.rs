//! Tests for label sourced backups run through a proxy container

use std::sync::Arc;
use test_utils::{
    labeled_volume, network, ConfigLoader, ConfigStrategy, DockerCall, DockerOperations, EnvContext, MockDockerOps,
    TestContext,
};
use volume_backup::managers::scheduler::BackupRunner;
use volume_backup::utils::docker_ops::MountKind;
use volume_backup::ScriptRunner;

fn docker() -> Arc<MockDockerOps> {
    Arc::new(
        MockDockerOps::new()
            .with_volumes(vec![labeled_volume(
                "app_data",
                &[
                    ("BACKUP_CRON_EXPRESSION", "@hourly"),
                    ("OFFEN_BACKUP_PROXYNETWORK", "backups"),
                ],
            )])
            .with_networks(vec![network("net-1", "backups")]),
    )
}

#[tokio::test]
async fn test_label_config_runs_in_proxy_container() {
    let ctx = TestContext::new();
    let docker = docker();
    let loader = ConfigLoader::new()
        .with_base_env(EnvContext::from_pairs([("HOSTNAME", "host-1")]))
        .with_docker(docker.clone());
    let config = loader.load(ConfigStrategy::Label).await.unwrap().remove(0);

    let runner = ScriptRunner::new(ctx.deps().with_docker(Some(docker.clone() as Arc<dyn DockerOperations>)));
    runner.run_proxy(&config).await.unwrap();

    let spec = docker
        .get_calls()
        .into_iter()
        .find_map(|call| match call {
            DockerCall::Create { spec } => Some(spec),
            _ => None,
        })
        .unwrap();
    assert_eq!(spec.network.as_deref(), Some("net-1"));
    assert!(spec
        .env
        .contains(&("OFFEN_BACKUP_CRONEXPRESSION".to_string(), "@hourly".to_string())));
    assert!(spec.env.contains(&("HOSTNAME".to_string(), "host-1".to_string())));
    assert!(spec
        .mounts
        .iter()
        .any(|m| m.kind == MountKind::Volume && m.source == "app_data" && m.target == "/backup"));
    assert_eq!(docker.removed(), vec!["mock-container"]);
}

#[tokio::test]
async fn test_proxy_requires_docker() {
    let ctx = TestContext::new();
    let docker = docker();
    let loader = ConfigLoader::new()
        .with_base_env(EnvContext::new())
        .with_docker(docker);
    let config = loader.load(ConfigStrategy::Label).await.unwrap().remove(0);

    let err = ScriptRunner::new(ctx.deps()).run_proxy(&config).await.unwrap_err();

    assert!(err.to_string().contains("app_data"));
}
