//! Unit tests for storage backends
//!
//! The local backend runs against a temp dir; remote backends are covered
//! through the fan-out helpers with in-memory mocks.

use chrono::Utc;
use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use test_utils::{MockStorage, StorageBackend, TestContext};
use volume_backup::storage::{copy_all, prune_all, tracing_log, LocalStorage, PrunePolicy};

fn policy(retention_days: i32, prefix: &str) -> PrunePolicy {
    PrunePolicy {
        retention_days,
        leeway: Duration::from_secs(60),
        prefix: prefix.to_string(),
        skip: Vec::new(),
    }
}

fn backdate(path: &std::path::Path, days: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60))
        .unwrap();
}

#[tokio::test]
async fn test_local_copy_updates_latest_symlink() {
    let ctx = TestContext::new();
    let archive = ctx.create_file("work/backup-1.tar.gz", "data");
    let storage = LocalStorage::new(ctx.archive_dir(), "latest.tar.gz", tracing_log());

    let location = storage.copy(&archive).await.unwrap();

    assert!(location.ends_with("backup-1.tar.gz"));
    let link = ctx.archive_dir().join("latest.tar.gz");
    assert_eq!(std::fs::read_link(&link).unwrap().to_str(), Some("backup-1.tar.gz"));

    let second = ctx.create_file("work/backup-2.tar.gz", "data");
    storage.copy(&second).await.unwrap();
    assert_eq!(std::fs::read_link(&link).unwrap().to_str(), Some("backup-2.tar.gz"));
}

#[tokio::test]
async fn test_local_prune_removes_expired_archives() {
    let ctx = TestContext::new();
    for (name, age) in [("backup-old.tar.gz", 30), ("backup-older.tar.gz", 40), ("backup-new.tar.gz", 0)] {
        let path = ctx.create_file(&format!("archive/{}", name), "data");
        backdate(&path, age);
    }
    let unrelated = ctx.create_file("archive/notes.txt", "keep");
    backdate(&unrelated, 90);

    let storage = LocalStorage::new(ctx.archive_dir(), "", tracing_log());
    let stats = storage.prune(&policy(7, "backup-"), Utc::now()).await.unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.pruned, 2);
    assert_eq!(ctx.archived_files(), vec!["backup-new.tar.gz", "notes.txt"]);
}

#[tokio::test]
async fn test_local_prune_refuses_to_delete_everything() {
    let ctx = TestContext::new();
    for name in ["backup-a.tar.gz", "backup-b.tar.gz"] {
        let path = ctx.create_file(&format!("archive/{}", name), "data");
        backdate(&path, 30);
    }

    let storage = LocalStorage::new(ctx.archive_dir(), "", tracing_log());
    let stats = storage.prune(&policy(7, "backup-"), Utc::now()).await.unwrap();

    assert_eq!(stats.total, 2);
    assert_eq!(stats.pruned, 0);
    assert_eq!(ctx.archived_files().len(), 2);
}

#[tokio::test]
async fn test_local_prune_disabled_by_negative_retention() {
    let ctx = TestContext::new();
    let path = ctx.create_file("archive/backup-a.tar.gz", "data");
    backdate(&path, 365);

    let storage = LocalStorage::new(ctx.archive_dir(), "", tracing_log());
    let stats = storage.prune(&policy(-1, ""), Utc::now()).await.unwrap();

    assert_eq!(stats.total, 0);
    assert_eq!(ctx.archived_files(), vec!["backup-a.tar.gz"]);
}

#[tokio::test]
async fn test_copy_all_reports_each_backend() {
    let ctx = TestContext::new();
    let archive = ctx.create_file("work/backup.tar.gz", "data");
    let s3 = MockStorage::new("S3");
    let webdav = MockStorage::new("WebDAV").with_failing_copy();
    let backends: Vec<Arc<dyn StorageBackend>> = vec![Arc::new(s3.clone()), Arc::new(webdav.clone())];

    let results = copy_all(&backends, &archive).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "S3");
    assert_eq!(results[0].1.as_deref().ok(), Some("mock://s3/backup.tar.gz"));
    assert_eq!(results[1].0, "WebDAV");
    assert!(results[1].1.is_err());
    assert_eq!(s3.copied(), vec![archive.clone()]);
    assert_eq!(webdav.copied(), vec![archive]);
}

#[tokio::test]
async fn test_prune_all_honors_skip_list() {
    let s3 = MockStorage::new("S3").with_prune_stats(4, 1);
    let ssh = MockStorage::new("SSH");
    let backends: Vec<Arc<dyn StorageBackend>> = vec![Arc::new(s3.clone()), Arc::new(ssh.clone())];
    let mut policy = policy(7, "");
    policy.skip = vec!["ssh".to_string()];

    let results = prune_all(&backends, &policy, Utc::now()).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "S3");
    assert_eq!(results[0].1.as_ref().unwrap().pruned, 1);
    assert_eq!(s3.prune_count(), 1);
    assert_eq!(ssh.prune_count(), 0);
}
