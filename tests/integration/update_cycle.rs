//! Check → download → install through the public manager API.

use std::sync::Arc;
use std::time::Duration;

use pfupdate::core::Channel;
use pfupdate::test_utils::fixtures;
use pfupdate::update::version_check::compare;
use pfupdate::update::{
    CheckTrigger, InstallRequest, LocalVersion, SessionState, VersionOrdering,
};

use crate::common::{EXE, Scenario};

#[tokio::test]
async fn test_patch_release_is_offered_and_installed() {
    let scenario = Scenario::new();
    let manifest = scenario.publish_release("1.0.1");
    assert_eq!(manifest.build_number, 10001);

    let manager = scenario.manager();
    let session = manager.check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(session.state, SessionState::UpdateAvailable);
    assert_eq!(
        compare(&session.local_version, &manifest.version, manifest.build_number),
        VersionOrdering::Newer
    );

    let session = manager.download().await.unwrap();
    assert_eq!(session.state, SessionState::Verifying);
    let session = manager.install(InstallRequest::default()).await.unwrap();
    assert_eq!(session.state, SessionState::Succeeded);

    assert_eq!(scenario.read_app(EXE), "v1.0.1 binary");
    assert_eq!(scenario.read_app("resources/app.asar"), "1.0.1 bundle");
    let installed = manager.installer().installed_version().await.unwrap();
    assert_eq!(installed.version, "1.0.1");
    assert_eq!(installed.build_number, 10001);

    // Same version again is not re-offered.
    let session = manager.check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(session.state, SessionState::Idle);
}

#[tokio::test]
async fn test_local_build_ahead_is_not_offered() {
    let scenario = Scenario::new();
    let body = b"rebuilt".to_vec();
    let mut manifest = fixtures::manifest("1.0.0", Channel::Stable, &body);
    manifest.build_number = 9999;
    scenario.publish_body(manifest.clone(), body);

    let local = LocalVersion::new("1.0.0").with_build(10000);
    assert_eq!(compare(&local, "1.0.0", 9999), VersionOrdering::Older);

    let session = scenario.manager().check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(session.state, SessionState::Idle);
    assert_eq!(session.current_manifest.unwrap().build_number, 9999);
}

#[tokio::test]
async fn test_only_one_session_at_a_time() {
    let scenario = Scenario::new();
    scenario.publish_release("1.1.0");
    scenario.transport.set_latency(Duration::from_millis(500));
    let manager = scenario.manager();

    let background = Arc::clone(&manager);
    let scheduled = tokio::spawn(async move { background.check(CheckTrigger::Scheduled).await });
    while manager.snapshot().state != SessionState::Checking {
        tokio::task::yield_now().await;
    }

    let before = manager.snapshot();
    let manual = manager.check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(manual.id, before.id);
    assert_eq!(manual.state, SessionState::Checking);

    let finished = scheduled.await.unwrap().unwrap();
    assert_eq!(finished.id, before.id);
    assert_eq!(finished.state, SessionState::UpdateAvailable);

    // Still holding the offer: another check is refused too.
    let again = manager.check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(again.id, before.id);
    assert_eq!(again.state, SessionState::UpdateAvailable);
}

#[tokio::test]
async fn test_progress_notifications() {
    let scenario = Scenario::new();
    let body = fixtures::payload(400_000);
    let manifest = fixtures::manifest("1.0.1", Channel::Stable, &body);
    scenario.publish_body(manifest, body);
    scenario.transport.set_chunk_size(8_192);

    let manager = scenario.manager();
    let mut events = manager.subscribe();
    manager.check(CheckTrigger::Manual).await.unwrap();
    manager.download().await.unwrap();

    let mut progress = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Some(p) = event.progress
            && event.state == SessionState::Downloading
        {
            progress.push(p);
        }
    }
    assert!(progress.len() > 2);
    assert!(progress.windows(2).all(|w| w[0].bytes_done <= w[1].bytes_done));
    let last = progress.last().unwrap();
    assert_eq!(last.bytes_done, 400_000);
    assert_eq!(last.bytes_total, 400_000);
}

#[tokio::test]
async fn test_backups_are_pruned_after_install() {
    let mut scenario = Scenario::new();
    scenario.settings.keep_backups = 1;
    let manager = scenario.manager();

    for version in ["1.0.1", "1.0.2"] {
        scenario.publish_release(version);
        manager.check(CheckTrigger::Manual).await.unwrap();
        manager.download().await.unwrap();
        let session = manager.install(InstallRequest::default()).await.unwrap();
        assert_eq!(session.state, SessionState::Succeeded, "installing {version}");
    }

    let backups = manager.backups().list().await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].source_version, "1.0.1");
    assert_eq!(scenario.read_app(EXE), "v1.0.2 binary");
}
