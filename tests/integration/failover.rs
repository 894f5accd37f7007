//! Endpoint outages seen through the manager.

use pfupdate::core::ErrorCode;
use pfupdate::update::{CheckTrigger, SessionState};

use crate::common::{ENDPOINTS, MIRROR_B, PRIMARY, Scenario, dir_is_empty};

#[tokio::test]
async fn test_all_endpoints_down_fails_without_side_effects() {
    let scenario = Scenario::new();
    scenario.publish_release("1.0.1");
    for base in ENDPOINTS {
        scenario.transport.set_down(base, true);
    }

    let manager = scenario.manager();
    let session = manager.check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(session.state, SessionState::Failed);
    assert_eq!(session.error.unwrap().code, ErrorCode::AllEndpointsUnhealthy);

    assert!(scenario.transport.opens().is_empty());
    assert!(dir_is_empty(&scenario.data_dir.downloads_dir()));
    assert!(dir_is_empty(&scenario.data_dir.backups_dir()));

    // Recoverable: the next check may run.
    for base in ENDPOINTS {
        scenario.transport.set_down(base, false);
    }
    let fresh = scenario.manager();
    let session = fresh.check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(session.state, SessionState::UpdateAvailable);
}

#[tokio::test]
async fn test_failing_primary_falls_over_to_mirror() {
    let scenario = Scenario::new();
    scenario.publish_release("1.0.1");
    scenario.transport.fail_requests(PRIMARY, true);

    let manager = scenario.manager();
    let session = manager.check(CheckTrigger::Manual).await.unwrap();
    assert_eq!(session.state, SessionState::UpdateAvailable);

    let summary = manager.endpoint_summary().await;
    assert!(!summary[0].health.is_healthy);
    assert_eq!(summary[0].health.consecutive_failures, 1);
    assert!(summary[1].health.is_healthy);
}

#[tokio::test]
async fn test_artifact_mirrors_follow_endpoints() {
    let scenario = Scenario::new();
    let body = pfupdate::test_utils::fixtures::payload(4_000);
    let mut manifest = pfupdate::test_utils::fixtures::manifest(
        "1.0.1",
        pfupdate::core::Channel::Stable,
        &body,
    );
    manifest.download_url = format!("{PRIMARY}/stable/PersonalFinanceDashboard-1.0.1.zip");
    let manifest = scenario.publish_body(manifest, body.clone());
    let mirrored = format!("{MIRROR_B}/stable/PersonalFinanceDashboard-1.0.1.zip");
    scenario.transport.put(&mirrored, body);

    let manager = scenario.manager();
    manager.check(CheckTrigger::Manual).await.unwrap();
    scenario.transport.fail_requests(PRIMARY, true);
    let session = manager.download().await.unwrap();
    assert_eq!(session.state, SessionState::Verifying);

    let opened: Vec<String> = scenario.transport.opens().into_iter().map(|(url, _)| url).collect();
    assert_eq!(opened, vec![manifest.download_url.clone(), mirrored]);

    // The failed artifact request counts against the primary.
    let summary = manager.endpoint_summary().await;
    assert!(!summary[0].health.is_healthy);
    assert_eq!(summary[0].stats.failures, 1);
    let history = manager.failover_history().await;
    let last = history.last().unwrap();
    assert_eq!(last.from, "endpoint-0");
    assert_eq!(last.to.as_deref(), Some("endpoint-1"));
}

#[tokio::test]
async fn test_artifact_hosted_only_on_mirror() {
    let scenario = Scenario::new();
    let body = pfupdate::test_utils::fixtures::payload(4_000);
    let mut manifest = pfupdate::test_utils::fixtures::manifest(
        "1.0.1",
        pfupdate::core::Channel::Stable,
        &body,
    );
    manifest.download_url = format!("{MIRROR_B}/stable/PersonalFinanceDashboard-1.0.1.zip");
    let manifest = scenario.publish_body(manifest, body);

    let manager = scenario.manager();
    manager.check(CheckTrigger::Manual).await.unwrap();
    let session = manager.download().await.unwrap();
    assert_eq!(session.state, SessionState::Verifying);

    let opened: Vec<String> = scenario.transport.opens().into_iter().map(|(url, _)| url).collect();
    assert_eq!(opened, vec![manifest.download_url.clone()]);
}
