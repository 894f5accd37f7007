//! Install failures, automatic rollback and manual restores.

use pfupdate::core::{ErrorCode, UpdateError};
use pfupdate::update::installer::InstallFailpoint;
use pfupdate::update::{CheckTrigger, InstallRequest, SessionState};

use crate::common::{EXE, Scenario};

async fn ready_to_install(scenario: &Scenario) -> std::sync::Arc<pfupdate::update::UpdateManager> {
    scenario.publish_release("1.0.1");
    let manager = scenario.manager();
    manager.check(CheckTrigger::Manual).await.unwrap();
    let session = manager.download().await.unwrap();
    assert_eq!(session.state, SessionState::Verifying);
    manager
}

#[tokio::test]
async fn test_swap_failure_ends_rolled_back() {
    let scenario = Scenario::new();
    let manager = ready_to_install(&scenario).await;
    manager.installer().arm_failpoint(InstallFailpoint::Swap);

    let session = manager.install(InstallRequest::default()).await.unwrap();
    assert_eq!(session.state, SessionState::RolledBack);
    let error = session.error.unwrap();
    assert_eq!(error.code, ErrorCode::FileSystem);
    let rollback = error.rollback.unwrap();
    assert!(rollback.success);
    assert_eq!(Some(rollback.backup_id.clone()), session.backup_id);

    assert_eq!(scenario.read_app(EXE), "v1.0.0 binary");
    assert_eq!(scenario.read_app("resources/app.asar"), "1.0.0 bundle");

    // A manual rollback onto the same backup is a no-op success.
    manager.installer().disarm_failpoints();
    let again = manager.rollback(Some(&rollback.backup_id)).await.unwrap();
    assert!(again.success);
    assert_eq!(again.restored_version, "1.0.0");
    assert_eq!(scenario.read_app(EXE), "v1.0.0 binary");
}

#[tokio::test]
async fn test_verification_failure_rolls_back_new_files() {
    let scenario = Scenario::new();
    let manager = ready_to_install(&scenario).await;
    manager.installer().arm_failpoint(InstallFailpoint::Verify);

    let session = manager.install(InstallRequest::default()).await.unwrap();
    assert_eq!(session.state, SessionState::RolledBack);
    assert_eq!(scenario.read_app(EXE), "v1.0.0 binary");
    assert_eq!(manager.local_version().await.version, "1.0.0");
}

#[tokio::test]
async fn test_failed_rollback_is_fatal() {
    let scenario = Scenario::new();
    let manager = ready_to_install(&scenario).await;
    manager.installer().arm_failpoint(InstallFailpoint::Verify);
    manager.installer().arm_failpoint(InstallFailpoint::Restore);

    let session = manager.install(InstallRequest::default()).await.unwrap();
    assert_eq!(session.state, SessionState::Failed);
    let rollback = session.error.unwrap().rollback.unwrap();
    assert!(!rollback.success);
    assert!(rollback.error.is_some());

    // The backup survives for manual recovery.
    manager.installer().disarm_failpoints();
    let restored = manager.rollback(Some(&rollback.backup_id)).await.unwrap();
    assert!(restored.success);
    assert_eq!(scenario.read_app(EXE), "v1.0.0 binary");
}

#[tokio::test]
async fn test_rollback_after_successful_install() {
    let scenario = Scenario::new();
    let manager = ready_to_install(&scenario).await;
    let session = manager.install(InstallRequest::default()).await.unwrap();
    assert_eq!(session.state, SessionState::Succeeded);
    assert_eq!(scenario.read_app(EXE), "v1.0.1 binary");

    let first = manager.rollback(None).await.unwrap();
    let second = manager.rollback(None).await.unwrap();
    assert!(first.success && second.success);
    assert_eq!(first.backup_id, second.backup_id);
    assert_eq!(scenario.read_app(EXE), "v1.0.0 binary");
    assert_eq!(manager.snapshot().local_version.version, "1.0.0");
}

#[tokio::test]
async fn test_rollback_unknown_backup() {
    let scenario = Scenario::new();
    let manager = scenario.manager();
    let err = manager.rollback(Some("20240101000000-0.9.0-deadbeef")).await.unwrap_err();
    assert!(matches!(err, UpdateError::BackupNotFound { .. }));
}

#[tokio::test]
async fn test_incompatible_artifact_touches_nothing() {
    let scenario = Scenario::new();
    let body = b"macos build".to_vec();
    let mut manifest =
        pfupdate::test_utils::fixtures::manifest("1.0.1", pfupdate::core::Channel::Stable, &body);
    let foreign = if cfg!(target_os = "macos") { "Windows 10 or later" } else { "macOS 12" };
    manifest.system_requirements.insert("os".to_string(), foreign.to_string());
    scenario.publish_body(manifest, body);

    let manager = scenario.manager();
    manager.check(CheckTrigger::Manual).await.unwrap();
    manager.download().await.unwrap();
    let session = manager.install(InstallRequest::default()).await.unwrap();

    assert_eq!(session.state, SessionState::Failed);
    assert_eq!(session.error.unwrap().code, ErrorCode::IncompatibleArtifact);
    assert!(manager.backups().list().await.unwrap().is_empty());
    assert_eq!(scenario.read_app(EXE), "v1.0.0 binary");
}
