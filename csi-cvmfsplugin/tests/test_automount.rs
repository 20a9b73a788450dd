use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cvmfsplugin::automount::{AutomountError, AutomountManager, AutomountOpts, spawn_daemon};
use serial_test::serial;
use tracing::level_filters::LevelFilter;

use crate::common::FakeHost;

mod common;

fn opts(dir: &Path) -> AutomountOpts {
    AutomountOpts {
        autofs_root: dir.join("cvmfs"),
        start_automount_daemon: false,
        config_path: dir.join("autofs"),
        poll_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

fn manager(opts: AutomountOpts, host: &Arc<FakeHost>) -> AutomountManager {
    AutomountManager::new(opts, host.clone(), host.clone())
}

#[tokio::test]
async fn test_setup_succeeds_once_autofs_is_live() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();
    host.autofs_after(Some(3));
    let opts = opts(dir.path());
    let root = opts.autofs_root.clone();

    let daemon = manager(opts, &host).setup().await.unwrap();
    assert!(daemon.is_none());
    assert_eq!(host.autofs_attempts(), 3);
    assert_eq!(
        host.commands(),
        vec![
            "cvmfs_config setup".to_string(),
            format!("mount --make-shared {}", root.display()),
        ]
    );
    // the daemon is not ours, so neither is its config
    assert!(!dir.path().join("autofs").exists());
}

#[tokio::test]
async fn test_setup_times_out_without_sharing() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();
    host.autofs_after(None);
    let opts = AutomountOpts {
        startup_timeout: 4,
        ..opts(dir.path())
    };

    let err = manager(opts, &host).setup().await.unwrap_err();
    assert!(matches!(err, AutomountError::Timeout { attempts: 4, .. }));
    assert_eq!(host.autofs_attempts(), 4);
    assert_eq!(host.commands(), vec!["cvmfs_config setup"]);
}

#[tokio::test]
async fn test_zero_startup_timeout_fails_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();
    host.autofs_after(Some(1));
    let opts = AutomountOpts {
        startup_timeout: 0,
        ..opts(dir.path())
    };

    let err = manager(opts, &host).setup().await.unwrap_err();
    assert!(matches!(err, AutomountError::Timeout { attempts: 0, .. }));
    assert_eq!(host.autofs_attempts(), 0);
}

#[tokio::test]
async fn test_alien_cache_is_made_world_writable() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cvmfs-aliencache");
    std::fs::create_dir(&cache).unwrap();
    std::fs::set_permissions(&cache, std::fs::Permissions::from_mode(0o700)).unwrap();

    let host = FakeHost::new();
    host.autofs_after(Some(1));
    let opts = AutomountOpts {
        alien_cache: Some(cache.clone()),
        ..opts(dir.path())
    };
    manager(opts, &host).setup().await.unwrap();

    let mode = std::fs::metadata(&cache).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o777);
}

#[tokio::test]
async fn test_missing_alien_cache_aborts_setup() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();
    let opts = AutomountOpts {
        alien_cache: Some(dir.path().join("missing")),
        ..opts(dir.path())
    };

    let err = manager(opts, &host).setup().await.unwrap_err();
    assert!(matches!(err, AutomountError::AlienCache { .. }));
    assert!(host.commands().is_empty());
}

#[tokio::test]
async fn test_cvmfs_config_failure_aborts_setup() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();
    host.fail("cvmfs_config", "cvmfs_config: command failed\n");
    host.autofs_after(Some(1));

    let err = manager(opts(dir.path()), &host).setup().await.unwrap_err();
    assert!(matches!(err, AutomountError::Setup(_)));
    assert_eq!(host.autofs_attempts(), 0);
}

#[tokio::test]
async fn test_make_shared_failure() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();
    host.fail("mount", "mount: permission denied\n");
    host.autofs_after(Some(1));

    let err = manager(opts(dir.path()), &host).setup().await.unwrap_err();
    assert!(matches!(err, AutomountError::MakeShared { .. }));
}

#[tokio::test]
#[serial]
async fn test_setup_starts_daemon_with_config() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();
    host.autofs_after(Some(1));
    let opts = AutomountOpts {
        start_automount_daemon: true,
        // `true` ignores the automount arguments and exits cleanly
        daemon_program: "true".to_string(),
        unmount_after_idle: 0,
        log_level: LevelFilter::DEBUG,
        ..opts(dir.path())
    };

    let daemon = manager(opts, &host).setup().await.unwrap().unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("autofs")).unwrap(),
        "USE_MISC_DEVICE=\"yes\"\nTIMEOUT=0\n"
    );

    let exit = daemon.wait().await;
    assert!(exit.success());
}

#[tokio::test]
#[serial]
async fn test_daemon_dying_during_startup_is_not_a_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();
    host.autofs_after(None);
    let opts = AutomountOpts {
        start_automount_daemon: true,
        daemon_program: "false".to_string(),
        startup_timeout: 100_000,
        ..opts(dir.path())
    };

    let err = tokio::time::timeout(Duration::from_secs(10), manager(opts, &host).setup())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        AutomountError::DaemonExited(exit) => {
            assert!(!exit.success());
            assert_eq!(exit.status.unwrap().code(), Some(1));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(host.autofs_attempts() < 100_000);
    assert!(!host.commands().iter().any(|c| c.contains("--make-shared")));
}

#[tokio::test]
#[serial]
async fn test_daemon_exit_is_reported() {
    let args = vec!["-c".to_string(), "echo mounted /cvmfs; exit 3".to_string()];
    let daemon = spawn_daemon("sh", &args).unwrap();
    let pid = daemon.pid;

    let exit = daemon.wait().await;
    assert_eq!(exit.pid, pid);
    assert!(!exit.success());
    assert_eq!(exit.status.as_ref().unwrap().code(), Some(3));
}

#[tokio::test]
async fn test_daemon_spawn_failure() {
    let err = spawn_daemon("/nonexistent/automount", &[]).unwrap_err();
    assert!(matches!(err, AutomountError::Spawn { .. }));
}
