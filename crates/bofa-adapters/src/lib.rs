//! Per-browser snapshot adapters: read the `latest_*_versions.xml` files and hand raw
//! release fields to the merge engine.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use bofa_core::{Browser, BrowserFeedConfig, RawRelease};
use bofa_storage::{XmlDocument, XmlElement, XmlError};
use thiserror::Error;

pub const CRATE_NAME: &str = "bofa-adapters";

pub const BOFA_LOGO_URL: &str = "https://bofa.cocolabs.dev/images/bofa_logo.png";

/// Value the snapshot generators write when a field could not be fetched.
const PLACEHOLDER: &str = "N/A";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed snapshot {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: XmlError,
    },
    #[error("snapshot root is <{found}>, expected <{expected}>")]
    UnexpectedRoot {
        expected: &'static str,
        found: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub trait BrowserAdapter: Send + Sync {
    fn browser(&self) -> Browser;
    fn snapshot_filename(&self) -> &'static str;
    fn parse_snapshot(&self, document: &XmlDocument) -> Result<Vec<RawRelease>, AdapterError>;

    /// Snapshot location relative to the workspace root.
    fn snapshot_path(&self) -> PathBuf {
        Path::new(&self.browser().files_dir()).join(self.snapshot_filename())
    }
}

/// Snapshot with a `<stable>` element carrying `version`, `release_time` and a download tag.
struct StableChannelAdapter {
    browser: Browser,
    snapshot_filename: &'static str,
    download_tag: &'static str,
}

/// Snapshot listing `<Version>` entries; only the `current` channel is released.
struct VersionEntriesAdapter {
    browser: Browser,
    snapshot_filename: &'static str,
    channel: &'static str,
}

fn field(element: &XmlElement, name: &str) -> Option<String> {
    element
        .child(name)
        .map(|el| el.text().trim().to_string())
        .filter(|value| !value.is_empty() && value != PLACEHOLDER)
}

fn expect_root(document: &XmlDocument, expected: &'static str) -> Result<(), AdapterError> {
    if document.root.name == expected {
        Ok(())
    } else {
        Err(AdapterError::UnexpectedRoot {
            expected,
            found: document.root.name.clone(),
        })
    }
}

impl BrowserAdapter for StableChannelAdapter {
    fn browser(&self) -> Browser {
        self.browser
    }

    fn snapshot_filename(&self) -> &'static str {
        self.snapshot_filename
    }

    fn parse_snapshot(&self, document: &XmlDocument) -> Result<Vec<RawRelease>, AdapterError> {
        expect_root(document, "mac_versions")?;
        Ok(document
            .root
            .children_named("stable")
            .take(1)
            .map(|stable| RawRelease {
                short_version: field(stable, "version"),
                update_download: field(stable, self.download_tag),
                last_updated: field(stable, "release_time"),
            })
            .collect())
    }
}

impl BrowserAdapter for VersionEntriesAdapter {
    fn browser(&self) -> Browser {
        self.browser
    }

    fn snapshot_filename(&self) -> &'static str {
        self.snapshot_filename
    }

    fn parse_snapshot(&self, document: &XmlDocument) -> Result<Vec<RawRelease>, AdapterError> {
        expect_root(document, "EdgeLatestVersions")?;
        Ok(document
            .root
            .children_named("Version")
            .filter(|entry| field(entry, "Channel").as_deref() == Some(self.channel))
            .map(|entry| RawRelease {
                short_version: field(entry, "Version"),
                update_download: field(entry, "Location"),
                last_updated: field(entry, "Date"),
            })
            .collect())
    }
}

pub fn chrome_adapter() -> impl BrowserAdapter {
    StableChannelAdapter {
        browser: Browser::Chrome,
        snapshot_filename: "chrome_latest_versions.xml",
        download_tag: "download_link",
    }
}

pub fn edge_adapter() -> impl BrowserAdapter {
    VersionEntriesAdapter {
        browser: Browser::Edge,
        snapshot_filename: "edge_latest_versions.xml",
        channel: "current",
    }
}

pub fn firefox_adapter() -> impl BrowserAdapter {
    StableChannelAdapter {
        browser: Browser::Firefox,
        snapshot_filename: "firefox_latest_versions.xml",
        download_tag: "download",
    }
}

pub fn adapter_for_browser(browser: Browser) -> Box<dyn BrowserAdapter> {
    match browser {
        Browser::Chrome => Box::new(chrome_adapter()),
        Browser::Edge => Box::new(edge_adapter()),
        Browser::Firefox => Box::new(firefox_adapter()),
    }
}

/// Channel metadata for the feeds published out of the box.
pub fn builtin_feed_config(browser: Browser) -> BrowserFeedConfig {
    let (channel_description, release_notes_url) = match browser {
        Browser::Chrome => (
            "Google Chrome for Mac",
            "https://chromereleases.googleblog.com/",
        ),
        Browser::Edge => (
            "Microsoft Edge for Mac",
            "https://learn.microsoft.com/en-us/deployedge/microsoft-edge-relnote-stable-channel",
        ),
        Browser::Firefox => (
            "Mozilla Firefox for Mac",
            "https://www.mozilla.org/en-US/firefox/notes/",
        ),
    };
    let name = browser.display_name();
    BrowserFeedConfig {
        name: name.to_string(),
        feed_filename: format!("{}_rss.xml", browser.as_str()),
        channel_title: format!("BOFA - {name} RSS Feed"),
        channel_description: channel_description.to_string(),
        release_notes_url: release_notes_url.to_string(),
        item_title: format!("New {name} Release"),
        image_url: BOFA_LOGO_URL.to_string(),
    }
}

pub fn parse_snapshot_file(
    adapter: &dyn BrowserAdapter,
    path: impl AsRef<Path>,
) -> Result<Vec<RawRelease>, AdapterError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let document = XmlDocument::parse(&text).map_err(|source| AdapterError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    adapter.parse_snapshot(&document)
}

/// Read the adapter's snapshot under `workspace_root`. A missing file yields `None`.
pub fn load_snapshot(
    adapter: &dyn BrowserAdapter,
    workspace_root: impl AsRef<Path>,
) -> Result<Option<Vec<RawRelease>>, AdapterError> {
    let path = workspace_root.as_ref().join(adapter.snapshot_path());
    if !path.exists() {
        return Ok(None);
    }
    parse_snapshot_file(adapter, &path).map(Some)
}
