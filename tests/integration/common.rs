//! Shared scenario setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pfupdate::config::{DataDir, SettingsStore, UpdateSettings};
use pfupdate::core::Channel;
use pfupdate::test_utils::{FakeTransport, fixtures, init_test_logging};
use pfupdate::update::{Endpoint, InstalledVersion, UpdateManager, VersionManifest};
use tempfile::TempDir;

pub const PRIMARY: &str = "https://primary.example.com";
pub const MIRROR_B: &str = "https://mirror-b.example.com";
pub const MIRROR_C: &str = "https://mirror-c.example.com";
pub const ENDPOINTS: [&str; 3] = [PRIMARY, MIRROR_B, MIRROR_C];
pub const EXE: &str = "PersonalFinanceDashboard.exe";

/// An installed 1.0.0 app, a data directory and three fake endpoints.
pub struct Scenario {
    pub temp: TempDir,
    pub data_dir: DataDir,
    pub transport: Arc<FakeTransport>,
    pub settings: UpdateSettings,
}

impl Scenario {
    pub fn new() -> Self {
        init_test_logging(None);
        let temp = TempDir::new().unwrap();
        let data_dir = DataDir::new(temp.path().join("data"));

        let app = temp.path().join("app");
        std::fs::create_dir_all(app.join("resources")).unwrap();
        std::fs::write(app.join(EXE), b"v1.0.0 binary").unwrap();
        std::fs::write(app.join("resources/app.asar"), b"1.0.0 bundle").unwrap();
        InstalledVersion {
            version: "1.0.0".to_string(),
            build_number: 10000,
            channel: Channel::Stable,
        }
        .write_to(&app)
        .unwrap();

        let settings = UpdateSettings {
            endpoints: ENDPOINTS
                .iter()
                .enumerate()
                .map(|(i, base)| Endpoint::new(format!("endpoint-{i}"), *base, i as u32))
                .collect(),
            ..UpdateSettings::default()
        };

        Self {
            temp,
            data_dir,
            transport: Arc::new(FakeTransport::new()),
            settings,
        }
    }

    pub fn app_dir(&self) -> PathBuf {
        self.temp.path().join("app")
    }

    /// A fresh manager over the same on-disk state, as after a restart.
    pub fn manager(&self) -> Arc<UpdateManager> {
        let store = SettingsStore::new(self.data_dir.settings_path(), self.settings.clone());
        Arc::new(UpdateManager::new(
            &self.data_dir,
            store,
            self.app_dir(),
            self.transport.clone(),
        ))
    }

    /// Publish a zip release of `version` on every endpoint.
    pub fn publish_release(&self, version: &str) -> VersionManifest {
        let exe = format!("v{version} binary");
        let bundle = format!("{version} bundle");
        let body = fixtures::zip_archive(&[
            (EXE, exe.as_bytes()),
            ("resources/app.asar", bundle.as_bytes()),
        ]);
        self.publish_body(fixtures::manifest(version, Channel::Stable, &body), body)
    }

    pub fn publish_body(&self, manifest: VersionManifest, body: Vec<u8>) -> VersionManifest {
        self.transport.put(&manifest.download_url, body);
        for base in ENDPOINTS {
            self.transport.publish_manifest(base, &manifest);
        }
        manifest
    }

    pub fn read_app(&self, relative: &str) -> String {
        std::fs::read_to_string(self.app_dir().join(relative)).unwrap()
    }
}

pub fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).map_or(true, |mut entries| entries.next().is_none())
}
