//! Sync pipeline: read each browser's snapshot, merge its release into the browser's feed
//! and report what happened, one browser at a time.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bofa_adapters::{adapter_for_browser, builtin_feed_config, load_snapshot};
use bofa_core::{Browser, BrowserFeedConfig, RawRelease, ReleaseRecord};
use bofa_feed::{
    EngineSettings, MergeEngine, MergeOutcome, MergeReport, DEFAULT_FEED_BASE_URL, DEFAULT_SITE_URL,
};
use bofa_storage::{export_json, export_yaml, snapshot_paths, FeedStore, StoredFeed, XmlDocument};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bofa-sync";

pub const FEEDS_FILE_NAME: &str = "feeds.yaml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedRegistry {
    pub feeds: Vec<FeedEntry>,
}

/// One registry entry. Unset fields fall back to the built-in channel metadata.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FeedEntry {
    pub browser: Browser,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub feed_filename: Option<String>,
    #[serde(default)]
    pub channel_title: Option<String>,
    #[serde(default)]
    pub channel_description: Option<String>,
    #[serde(default)]
    pub release_notes_url: Option<String>,
    #[serde(default)]
    pub item_title: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl FeedEntry {
    pub fn builtin(browser: Browser) -> Self {
        Self {
            browser,
            enabled: true,
            feed_filename: None,
            channel_title: None,
            channel_description: None,
            release_notes_url: None,
            item_title: None,
            image_url: None,
        }
    }

    pub fn feed_config(&self) -> BrowserFeedConfig {
        let mut config = builtin_feed_config(self.browser);
        let overrides = [
            (&mut config.feed_filename, &self.feed_filename),
            (&mut config.channel_title, &self.channel_title),
            (&mut config.channel_description, &self.channel_description),
            (&mut config.release_notes_url, &self.release_notes_url),
            (&mut config.item_title, &self.item_title),
            (&mut config.image_url, &self.image_url),
        ];
        for (slot, value) in overrides {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        config
    }

    /// Feed location relative to the workspace root, beside the browser's snapshot.
    pub fn feed_path(&self) -> PathBuf {
        Path::new(&self.browser.files_dir()).join(self.feed_config().feed_filename)
    }
}

impl FeedRegistry {
    pub fn builtin() -> Self {
        Self {
            feeds: Browser::ALL.into_iter().map(FeedEntry::builtin).collect(),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing feed registry")
    }

    /// Load the registry file, or the built-in registry when the file does not exist.
    pub fn load_or_builtin(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no feed registry; using built-in feeds");
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &FeedEntry> {
        self.feeds.iter().filter(|entry| entry.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub feeds_file: Option<PathBuf>,
    pub site_url: String,
    pub feed_base_url: String,
    pub export_snapshots: bool,
}

impl SyncConfig {
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            feeds_file: None,
            site_url: DEFAULT_SITE_URL.to_string(),
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
            export_snapshots: false,
        }
    }

    pub fn from_env() -> Self {
        let workspace_root = std::env::var("BOFA_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            feeds_file: std::env::var("BOFA_FEEDS_FILE").ok().map(PathBuf::from),
            site_url: std::env::var("BOFA_SITE_URL")
                .unwrap_or_else(|_| DEFAULT_SITE_URL.to_string()),
            feed_base_url: std::env::var("BOFA_FEED_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_FEED_BASE_URL.to_string()),
            export_snapshots: std::env::var("BOFA_EXPORT_SNAPSHOTS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ..Self::for_workspace(workspace_root)
        }
    }

    pub fn feeds_path(&self) -> PathBuf {
        self.feeds_file
            .clone()
            .unwrap_or_else(|| self.workspace_root.join(FEEDS_FILE_NAME))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            site_url: self.site_url.clone(),
            feed_base_url: self.feed_base_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeedStatus {
    Inserted,
    Updated,
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedRunOutcome {
    pub browser: Browser,
    pub feed_path: PathBuf,
    pub version: Option<String>,
    #[serde(flatten)]
    pub status: FeedStatus,
    pub content_hash: Option<String>,
    pub byte_size: Option<usize>,
    pub changed: bool,
}

impl FeedRunOutcome {
    fn new(browser: Browser, feed_path: &Path, status: FeedStatus) -> Self {
        Self {
            browser,
            feed_path: feed_path.to_path_buf(),
            version: None,
            status,
            content_hash: None,
            byte_size: None,
            changed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedRunOutcome>,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncRunSummary {
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing sync run summary")
    }
}

/// Result of merging one release into its feed file.
#[derive(Debug, Clone)]
pub struct AppliedRelease {
    pub report: MergeReport,
    pub stored: StoredFeed,
    pub document: XmlDocument,
}

/// Ensure, load, merge and save one release. Nothing is written if the feed fails to parse.
pub fn merge_release(
    store: &FeedStore,
    engine: &MergeEngine,
    record: &ReleaseRecord,
    feed_path: impl AsRef<Path>,
) -> Result<AppliedRelease> {
    let feed_path = feed_path.as_ref();
    if store.ensure(feed_path)? {
        info!(path = %feed_path.display(), "created new feed document");
    }
    let mut document = store.load(feed_path)?;
    let report = engine
        .apply(&mut document, record)
        .with_context(|| format!("merging {} into {}", record.version, feed_path.display()))?;
    let stored = store.save(&document, feed_path)?;
    info!(path = %stored.path.display(), changed = stored.changed, "wrote RSS feed");
    Ok(AppliedRelease {
        report,
        stored,
        document,
    })
}

/// Write `<feed>.json` and `<feed>.yaml` beside a saved feed.
pub fn export_feed_snapshots(document: &XmlDocument, xml_path: &Path) -> Result<(PathBuf, PathBuf)> {
    let (json_path, yaml_path) = snapshot_paths(xml_path);
    export_json(document, &json_path)?;
    export_yaml(document, &yaml_path)?;
    Ok((json_path, yaml_path))
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: FeedStore,
    engine: MergeEngine,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let store = FeedStore::new(config.workspace_root.clone());
        let engine = MergeEngine::new(config.engine_settings());
        Self {
            config,
            store,
            engine,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    pub fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = FeedRegistry::load_or_builtin(self.config.feeds_path())?;

        let mut feeds = Vec::new();
        for entry in registry.enabled() {
            let span = info_span!("feed", browser = %entry.browser, %run_id);
            let _guard = span.enter();
            feeds.extend(self.sync_feed(entry));
        }

        let count = |pred: fn(&FeedStatus) -> bool| feeds.iter().filter(|o| pred(&o.status)).count();
        let inserted = count(|s| matches!(s, FeedStatus::Inserted));
        let updated = count(|s| matches!(s, FeedStatus::Updated));
        let skipped = count(|s| matches!(s, FeedStatus::Skipped { .. }));
        let failed = count(|s| matches!(s, FeedStatus::Failed { .. }));
        info!(%run_id, inserted, updated, skipped, failed, "sync run finished");

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feeds,
            inserted,
            updated,
            skipped,
            failed,
        })
    }

    fn sync_feed(&self, entry: &FeedEntry) -> Vec<FeedRunOutcome> {
        let feed_path = entry.feed_path();
        let adapter = adapter_for_browser(entry.browser);

        let releases = match load_snapshot(adapter.as_ref(), self.store.root()) {
            Ok(Some(releases)) => releases,
            Ok(None) => {
                let reason = format!("no snapshot at {}", adapter.snapshot_path().display());
                info!(%reason, "skipping feed");
                return vec![FeedRunOutcome::new(
                    entry.browser,
                    &feed_path,
                    FeedStatus::Skipped { reason },
                )];
            }
            Err(err) => {
                error!(error = %err, "reading snapshot failed");
                return vec![FeedRunOutcome::new(
                    entry.browser,
                    &feed_path,
                    FeedStatus::Failed {
                        error: err.to_string(),
                    },
                )];
            }
        };

        if releases.is_empty() {
            let reason = "snapshot lists no release".to_string();
            info!(%reason, "skipping feed");
            return vec![FeedRunOutcome::new(
                entry.browser,
                &feed_path,
                FeedStatus::Skipped { reason },
            )];
        }

        let feed = entry.feed_config();
        releases
            .iter()
            .map(|raw| self.sync_release(entry.browser, &feed, &feed_path, raw))
            .collect()
    }

    fn sync_release(
        &self,
        browser: Browser,
        feed: &BrowserFeedConfig,
        feed_path: &Path,
        raw: &RawRelease,
    ) -> FeedRunOutcome {
        let record = match ReleaseRecord::from_raw(feed.clone(), raw) {
            Ok(record) => record,
            Err(err) => {
                warn!("{err}");
                return FeedRunOutcome::new(
                    browser,
                    feed_path,
                    FeedStatus::Skipped {
                        reason: err.to_string(),
                    },
                );
            }
        };

        let applied = match merge_release(&self.store, &self.engine, &record, feed_path) {
            Ok(applied) => applied,
            Err(err) => {
                error!(error = %format!("{err:#}"), version = %record.version, "feed update failed");
                let mut outcome = FeedRunOutcome::new(
                    browser,
                    feed_path,
                    FeedStatus::Failed {
                        error: format!("{err:#}"),
                    },
                );
                outcome.version = Some(record.version);
                return outcome;
            }
        };

        if self.config.export_snapshots {
            if let Err(err) = export_feed_snapshots(&applied.document, &applied.stored.path) {
                warn!(error = %format!("{err:#}"), "exporting feed snapshots failed");
            }
        }

        let status = match applied.report.outcome {
            MergeOutcome::Inserted => FeedStatus::Inserted,
            MergeOutcome::Updated { .. } => FeedStatus::Updated,
        };
        FeedRunOutcome {
            browser,
            feed_path: feed_path.to_path_buf(),
            version: Some(record.version),
            status,
            content_hash: Some(applied.stored.content_hash),
            byte_size: Some(applied.stored.byte_size),
            changed: applied.stored.changed,
        }
    }
}

pub fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env()).run_once()
}
