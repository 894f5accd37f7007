//! Interrupted downloads resume after a restart.

use pfupdate::core::{Channel, ErrorCode};
use pfupdate::test_utils::fixtures;
use pfupdate::update::{CheckTrigger, SessionState};

use crate::common::Scenario;

#[tokio::test]
async fn test_resume_from_sixty_percent_after_restart() {
    let scenario = Scenario::new();
    let body = fixtures::payload(10_000);
    let manifest = scenario.publish_body(fixtures::manifest("1.0.1", Channel::Stable, &body), body.clone());
    scenario.transport.truncate_after(&manifest.download_url, 6_000);

    let first = scenario.manager();
    first.check(CheckTrigger::Manual).await.unwrap();
    let session = first.download().await.unwrap();
    assert_eq!(session.state, SessionState::Failed);
    assert_eq!(session.error.unwrap().code, ErrorCode::Network);
    let part = first.downloader().part_path(&manifest);
    assert_eq!(std::fs::metadata(&part).unwrap().len(), 6_000);
    drop(first);

    // Process restart: new manager, same data directory and manifest.
    let second = scenario.manager();
    let session = second.check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(session.state, SessionState::UpdateAvailable);
    let session = second.download().await.unwrap();
    assert_eq!(session.state, SessionState::Verifying);

    let opens = scenario.transport.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[1], (manifest.download_url.clone(), 6_000));
    let artifact = second.downloader().artifact_path(&manifest);
    assert_eq!(std::fs::read(artifact).unwrap(), body);
    assert!(!part.exists());
}

#[tokio::test]
async fn test_restart_from_zero_without_range_support() {
    let scenario = Scenario::new();
    let body = fixtures::payload(10_000);
    let manifest = scenario.publish_body(fixtures::manifest("1.0.1", Channel::Stable, &body), body.clone());
    scenario.transport.truncate_after(&manifest.download_url, 6_000);

    let first = scenario.manager();
    first.check(CheckTrigger::Manual).await.unwrap();
    first.download().await.unwrap();

    scenario.transport.set_range_support(false);
    let second = scenario.manager();
    second.check(CheckTrigger::Manual).await.unwrap();
    let session = second.download().await.unwrap();
    assert_eq!(session.state, SessionState::Verifying);
    assert_eq!(std::fs::read(second.downloader().artifact_path(&manifest)).unwrap(), body);
}

#[tokio::test]
async fn test_corrupt_download_is_never_kept() {
    let scenario = Scenario::new();
    let body = fixtures::payload(5_000);
    let manifest = fixtures::manifest("1.0.1", Channel::Stable, &body);
    let mut corrupt = body.clone();
    corrupt[4_999] ^= 0xff;
    let manifest = scenario.publish_body(manifest, corrupt);

    let manager = scenario.manager();
    manager.check(CheckTrigger::Manual).await.unwrap();
    let session = manager.download().await.unwrap();
    assert_eq!(session.state, SessionState::Failed);
    assert_eq!(session.error.unwrap().code, ErrorCode::Integrity);
    assert!(!manager.downloader().artifact_path(&manifest).exists());
    assert!(!manager.downloader().part_path(&manifest).exists());
}
