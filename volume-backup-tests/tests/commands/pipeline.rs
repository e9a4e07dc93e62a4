//! Tests for the backup pipeline
//!
//! Archives are produced by the fake archiver; everything after that runs
//! for real, including the local storage backend.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use test_utils::{
    container, stoppable_container, ConfigBuilder, MockDockerOps, MockStorage, RecordingNotifier,
    StorageBackend, TestContext,
};
use volume_backup::managers::notification::NotificationKind;
use volume_backup::run_script;

fn backdate(path: &std::path::Path, days: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60))
        .unwrap();
}

#[tokio::test]
async fn test_backup_to_local_archive() {
    let ctx = TestContext::new();
    let config = ConfigBuilder::new()
        .archive(&ctx.archive_dir())
        .sources(&ctx.sources_dir())
        .filename("backup.{{ .Extension }}")
        .var("OFFEN_BACKUP_LATESTSYMLINK", "latest")
        .build();

    run_script(&config, &ctx.deps()).await.unwrap();

    assert_eq!(ctx.archived_files(), vec!["backup.tar.gz", "latest"]);
    assert!(!ctx.work_dir().join("backup.tar.gz").exists());
}

#[tokio::test]
async fn test_retention_prunes_local_archive() {
    let ctx = TestContext::new();
    let old = ctx.create_file("archive/backup-old.tar.gz", "data");
    backdate(&old, 30);
    let config = ConfigBuilder::new()
        .archive(&ctx.archive_dir())
        .filename("backup-new.{{ .Extension }}")
        .retention_days(7)
        .var("OFFEN_BACKUP_PRUNINGPREFIX", "backup-")
        .build();

    run_script(&config, &ctx.deps()).await.unwrap();

    assert_eq!(ctx.archived_files(), vec!["backup-new.tar.gz"]);
}

#[tokio::test]
async fn test_success_notification_carries_stats() {
    let ctx = TestContext::new();
    let storage = MockStorage::new("S3");
    let notifier = RecordingNotifier::new();
    ctx.create_file(
        "notifications.d/body_success.tmpl",
        "{{ .Stats.BackupFile.Name }} -> {{ .Stats.Storages.S3.Location }}",
    );
    let config = ConfigBuilder::new()
        .filename("backup.{{ .Extension }}")
        .notification_urls(&["https://hooks.example.com/backup"])
        .notification_level("info")
        .build();

    let deps = ctx.deps_with(vec![Arc::new(storage.clone())], Arc::new(notifier.clone()));
    run_script(&config, &deps).await.unwrap();

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Success);
    assert_eq!(sent[0].body, "backup.tar.gz -> mock://s3/backup.tar.gz");
    assert_eq!(storage.copied().len(), 1);
}

#[tokio::test]
async fn test_unreachable_notifier_does_not_fail_backup() {
    let ctx = TestContext::new();
    let storage = MockStorage::new("S3");
    let notifier = RecordingNotifier::failing();
    let config = ConfigBuilder::new()
        .archive(&ctx.archive_dir())
        .filename("backup.{{ .Extension }}")
        .notification_urls(&["https://hooks.example.com/backup"])
        .notification_level("info")
        .build();

    let deps = ctx.deps_with(vec![Arc::new(storage.clone())], Arc::new(notifier.clone()));
    run_script(&config, &deps).await.unwrap();

    assert_eq!(storage.copied().len(), 1);
    assert_eq!(notifier.sent().len(), 1);
    assert_eq!(notifier.sent()[0].kind, NotificationKind::Success);
}

#[tokio::test]
async fn test_failed_copy_notifies_failure() {
    let ctx = TestContext::new();
    let s3 = MockStorage::new("S3").with_failing_copy();
    let local = MockStorage::new("Local");
    let notifier = RecordingNotifier::new();
    let config = ConfigBuilder::new()
        .filename("backup.{{ .Extension }}")
        .retention_days(7)
        .notification_urls(&["https://hooks.example.com/backup"])
        .build();

    let backends: Vec<Arc<dyn StorageBackend>> = vec![Arc::new(s3.clone()), Arc::new(local.clone())];
    let err = run_script(&config, &ctx.deps_with(backends, Arc::new(notifier.clone())))
        .await
        .unwrap_err();

    assert!(format!("{:#}", err).contains("error copying archive"));
    assert_eq!(local.copied().len(), 1);
    assert_eq!(local.prune_count(), 1);
    assert_eq!(s3.prune_count(), 0);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Failure);
    assert!(sent[0].body.contains("upload rejected"));
}

#[tokio::test]
async fn test_labeled_containers_are_stopped_and_commands_run() {
    let ctx = TestContext::new();
    let docker = Arc::new(MockDockerOps::new().with_containers(vec![
        stoppable_container("db"),
        container("app", &[("docker-volume-backup.archive-pre", "pg_dump -f /tmp/dump.sql")]),
        container("proxy", &[]),
    ]));
    let storage = MockStorage::new("S3");
    let config = ConfigBuilder::new().filename("backup.{{ .Extension }}").build();

    let deps = ctx.deps_with_docker(
        vec![Arc::new(storage.clone())],
        Arc::new(RecordingNotifier::new()),
        docker.clone(),
    );
    run_script(&config, &deps).await.unwrap();

    assert_eq!(docker.stopped(), vec!["db"]);
    assert_eq!(docker.started(), vec!["db"]);
    assert_eq!(
        docker.exec_commands(),
        vec![("app".to_string(), "pg_dump -f /tmp/dump.sql".to_string())]
    );
    assert_eq!(storage.copied().len(), 1);
}

#[tokio::test]
async fn test_encrypted_archive_is_copied() {
    let ctx = TestContext::new();
    let storage = MockStorage::new("S3");
    let config = ConfigBuilder::new()
        .filename("backup.{{ .Extension }}")
        .var("OFFEN_BACKUP_GPGPASSPHRASE", "secret")
        .build();

    let deps = ctx.deps_with(vec![Arc::new(storage.clone())], Arc::new(RecordingNotifier::new()));
    run_script(&config, &deps).await.unwrap();

    let copied = storage.copied();
    assert_eq!(copied.len(), 1);
    assert!(copied[0].to_string_lossy().ends_with("backup.tar.gz.gpg"));
    assert!(!copied[0].exists());
}
