//! Manifest retrieval.
//!
//! The client fetches and validates the manifest for one channel from a
//! given endpoint. Choosing the endpoint belongs to the
//! [`FailoverSelector`]; [`ManifestClient::fetch_with_failover`] combines
//! the two.

use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{Channel, UpdateError};
use crate::update::failover::{Endpoint, FailoverSelector};
use crate::update::manifest::VersionManifest;
use crate::update::transport::Transport;

#[derive(Clone)]
pub struct ManifestClient {
    transport: Arc<dyn Transport>,
}

impl ManifestClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Fetch and parse the manifest for `channel` from `endpoint`.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::Network`] on transport failure
    /// - [`UpdateError::NotFound`] if the endpoint has no manifest for the channel
    /// - [`UpdateError::Parse`] if the document fails validation
    pub async fn fetch(
        &self,
        endpoint: &Endpoint,
        channel: Channel,
    ) -> Result<VersionManifest, UpdateError> {
        let url = endpoint.manifest_url(channel);
        debug!(endpoint = %endpoint.id, %channel, "Fetching manifest from {}", url);

        let body = self.transport.fetch(&url).await?;
        let manifest = VersionManifest::parse(&body, channel)?;

        info!(
            endpoint = %endpoint.id,
            %channel,
            version = %manifest.version,
            build = manifest.build_number,
            "Fetched manifest"
        );
        Ok(manifest)
    }

    /// Fetch from the best available endpoint, failing over on network errors.
    pub async fn fetch_with_failover(
        &self,
        selector: &FailoverSelector,
        channel: Channel,
    ) -> Result<(Endpoint, VersionManifest), UpdateError> {
        selector
            .execute(|endpoint| async move { self.fetch(&endpoint, channel).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeTransport, fixtures};
    use crate::update::failover::FailoverPolicy;

    #[tokio::test]
    async fn test_fetch_parses_manifest() {
        let transport = Arc::new(FakeTransport::new());
        let manifest = fixtures::manifest("1.0.1", Channel::Stable, b"payload");
        transport.publish_manifest("https://a.example.com", &manifest);

        let client = ManifestClient::new(transport.clone());
        let endpoint = Endpoint::new("primary", "https://a.example.com", 0);
        let fetched = client.fetch(&endpoint, Channel::Stable).await.unwrap();
        assert_eq!(fetched, manifest);
    }

    #[tokio::test]
    async fn test_missing_channel_is_not_found() {
        let transport = Arc::new(FakeTransport::new());
        let client = ManifestClient::new(transport);
        let endpoint = Endpoint::new("primary", "https://a.example.com", 0);

        let err = client.fetch(&endpoint, Channel::Dev).await.unwrap_err();
        assert!(matches!(err, UpdateError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_document_is_parse_error() {
        let transport = Arc::new(FakeTransport::new());
        transport.put(
            "https://a.example.com/stable/version.json",
            br#"{"version": "1.0.1"}"#.to_vec(),
        );
        let client = ManifestClient::new(transport);
        let endpoint = Endpoint::new("primary", "https://a.example.com", 0);

        let err = client.fetch(&endpoint, Channel::Stable).await.unwrap_err();
        assert!(matches!(err, UpdateError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_fetch_with_failover_uses_mirror() {
        let transport = Arc::new(FakeTransport::new());
        let manifest = fixtures::manifest("1.0.1", Channel::Stable, b"payload");
        transport.publish_manifest("https://a.example.com", &manifest);
        transport.publish_manifest("https://b.example.com", &manifest);
        transport.fail_requests("https://a.example.com", true);

        let selector = FailoverSelector::new(
            vec![
                Endpoint::new("primary", "https://a.example.com", 0),
                Endpoint::new("mirror", "https://b.example.com", 1),
            ],
            FailoverPolicy::default(),
            transport.clone(),
        );
        let client = ManifestClient::new(transport);

        let (endpoint, fetched) =
            client.fetch_with_failover(&selector, Channel::Stable).await.unwrap();
        assert_eq!(endpoint.id, "mirror");
        assert_eq!(fetched.version, "1.0.1");
    }
}
