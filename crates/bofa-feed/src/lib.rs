//! Incremental RSS merge engine: keeps channel singletons canonical and inserts or
//! refreshes one item per observed release.

use bofa_core::{coerce_pub_date_at, PubDate, ReleaseRecord};
use bofa_storage::{XmlDocument, XmlElement, ATOM_NAMESPACE};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bofa-feed";

pub const DEFAULT_SITE_URL: &str = "https://bofa.cocolabs.dev/";
pub const DEFAULT_FEED_BASE_URL: &str = "https://bofa.cocolabs.dev/rss_feeds";
pub const RSS_DOCS_URL: &str = "http://www.rssboard.org/rss-specification";
pub const CHANNEL_LANGUAGE: &str = "en-US";
pub const CHANNEL_TTL: &str = "60";

const ATOM_LINK: &str = "atom:link";
const ATOM_LINK_REL: &str = "self";
const ATOM_LINK_TYPE: &str = "application/rss+xml";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("document root is <{0}>, expected <rss>")]
    NotAFeed(String),
    #[error("feed document has no <channel>")]
    MissingChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSettings {
    pub site_url: String,
    pub feed_base_url: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            site_url: DEFAULT_SITE_URL.to_string(),
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
        }
    }
}

impl EngineSettings {
    /// Public URL of a feed file, used for the atom self link.
    pub fn feed_url(&self, feed_filename: &str) -> String {
        format!("{}/{}", self.feed_base_url.trim_end_matches('/'), feed_filename)
    }
}

/// Current values for the channel singletons of one feed.
#[derive(Debug, Clone, Copy)]
pub struct ChannelValues<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub site_url: &'a str,
    pub feed_url: &'a str,
    pub image_url: &'a str,
    pub last_build_date: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelReport {
    pub channel_created: bool,
    pub created: Vec<&'static str>,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The release was already present; `index` counts items from the top.
    Updated { index: usize },
    Inserted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    pub channel: ChannelReport,
    pub pub_date: PubDate,
}

/// Escaped-HTML description payload stored as the text of `<description>`.
pub fn render_description(version: &str, release_notes_url: &str) -> String {
    format!(
        "<br>Version: {version}<br>Release Notes: <a href=\"{release_notes_url}\">Release Notes</a>"
    )
}

fn feed_root_mut(document: &mut XmlDocument) -> Result<&mut XmlElement, FeedError> {
    if document.root.name != "rss" {
        return Err(FeedError::NotAFeed(document.root.name.clone()));
    }
    Ok(&mut document.root)
}

fn channel_mut(document: &mut XmlDocument) -> Result<&mut XmlElement, FeedError> {
    feed_root_mut(document)?
        .child_mut("channel")
        .ok_or(FeedError::MissingChannel)
}

/// Where newly created channel metadata goes: just above the first item.
fn metadata_insertion_point(channel: &XmlElement) -> usize {
    channel.position_of("item").unwrap_or(channel.children.len())
}

fn upsert_text(channel: &mut XmlElement, name: &'static str, value: &str, report: &mut ChannelReport) {
    report.duplicates_removed += channel.retain_first(name);
    match channel.child_mut(name) {
        Some(existing) => existing.set_text(value),
        None => {
            let at = metadata_insertion_point(channel);
            channel.insert_element(at, XmlElement::with_text(name, value));
            report.created.push(name);
        }
    }
}

fn upsert_atom_link(channel: &mut XmlElement, feed_url: &str, report: &mut ChannelReport) {
    report.duplicates_removed += channel.retain_first(ATOM_LINK);
    match channel.child_mut(ATOM_LINK) {
        Some(link) => {
            link.set_attribute("href", feed_url);
            link.set_attribute("rel", ATOM_LINK_REL);
            link.set_attribute("type", ATOM_LINK_TYPE);
        }
        None => {
            let at = metadata_insertion_point(channel);
            channel.insert_element(
                at,
                XmlElement::new(ATOM_LINK)
                    .with_attribute("href", feed_url)
                    .with_attribute("rel", ATOM_LINK_REL)
                    .with_attribute("type", ATOM_LINK_TYPE),
            );
            report.created.push(ATOM_LINK);
        }
    }
}

fn upsert_image(channel: &mut XmlElement, values: &ChannelValues<'_>, report: &mut ChannelReport) {
    report.duplicates_removed += channel.retain_first("image");
    match channel.child_mut("image") {
        Some(image) => {
            image.retain_first("link");
            match image.child_mut("link") {
                Some(link) => link.set_text(values.site_url),
                None => image.push_element(XmlElement::with_text("link", values.site_url)),
            }
        }
        None => {
            let at = metadata_insertion_point(channel);
            channel.insert_element(
                at,
                XmlElement::new("image")
                    .with_child(XmlElement::with_text("url", values.image_url))
                    .with_child(XmlElement::with_text("title", values.title))
                    .with_child(XmlElement::with_text("link", values.site_url)),
            );
            report.created.push("image");
        }
    }
}

/// Bring every channel singleton to exactly one element carrying the current value.
pub fn normalize_channel(
    document: &mut XmlDocument,
    values: &ChannelValues<'_>,
) -> Result<ChannelReport, FeedError> {
    let root = feed_root_mut(document)?;
    let mut report = ChannelReport::default();

    if root.attribute("version").is_none() {
        root.set_attribute("version", "2.0");
    }
    if root.attribute("xmlns:atom") != Some(ATOM_NAMESPACE) {
        root.set_attribute("xmlns:atom", ATOM_NAMESPACE);
    }
    if root.child("channel").is_none() {
        root.push_element(XmlElement::new("channel"));
        report.channel_created = true;
    }

    let channel = channel_mut(document)?;
    upsert_text(channel, "title", values.title, &mut report);
    upsert_text(channel, "link", values.site_url, &mut report);
    upsert_text(channel, "description", values.description, &mut report);
    upsert_text(channel, "docs", RSS_DOCS_URL, &mut report);
    upsert_atom_link(channel, values.feed_url, &mut report);
    upsert_text(channel, "language", CHANNEL_LANGUAGE, &mut report);
    upsert_text(channel, "ttl", CHANNEL_TTL, &mut report);
    upsert_text(channel, "lastBuildDate", values.last_build_date, &mut report);
    upsert_image(channel, values, &mut report);

    Ok(report)
}

fn item_mentions_version(item: &XmlElement, version: &str) -> bool {
    item.child("title")
        .is_some_and(|title| title.text().contains(version))
        || item
            .child("description")
            .is_some_and(|description| description.all_text().contains(version))
}

/// Refresh the description of the item already carrying `record.version`, or insert a new
/// item above every existing one.
pub fn merge_item(
    document: &mut XmlDocument,
    record: &ReleaseRecord,
    pub_date: &str,
) -> Result<MergeOutcome, FeedError> {
    let channel = channel_mut(document)?;
    let description = render_description(&record.version, &record.feed.release_notes_url);

    for (index, item) in channel
        .elements_mut()
        .filter(|el| el.name == "item")
        .enumerate()
    {
        if !item_mentions_version(item, &record.version) {
            continue;
        }
        match item.child_mut("description") {
            Some(existing) => existing.set_text(description),
            None => {
                let at = item.position_of("pubDate").unwrap_or(item.children.len());
                item.insert_element(at, XmlElement::with_text("description", description));
            }
        }
        return Ok(MergeOutcome::Updated { index });
    }

    let item = XmlElement::new("item")
        .with_child(XmlElement::with_text("title", record.feed.item_title.as_str()))
        .with_child(XmlElement::with_text("link", record.download_url.as_str()))
        .with_child(XmlElement::with_text("description", description))
        .with_child(XmlElement::with_text("pubDate", pub_date))
        .with_child(
            XmlElement::with_text("guid", record.download_url.as_str())
                .with_attribute("isPermaLink", "false"),
        );
    let at = metadata_insertion_point(channel);
    channel.insert_element(at, item);
    Ok(MergeOutcome::Inserted)
}

/// Applies release records to feed documents with fixed site/feed URLs.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    settings: EngineSettings,
}

impl MergeEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn apply(
        &self,
        document: &mut XmlDocument,
        record: &ReleaseRecord,
    ) -> Result<MergeReport, FeedError> {
        self.apply_at(document, record, Utc::now())
    }

    /// Normalize the channel, then insert or update the release item.
    pub fn apply_at(
        &self,
        document: &mut XmlDocument,
        record: &ReleaseRecord,
        now: DateTime<Utc>,
    ) -> Result<MergeReport, FeedError> {
        let pub_date = coerce_pub_date_at(&record.last_updated, now);
        if pub_date.is_fallback() {
            warn!(
                browser = record.name(),
                last_updated = %record.last_updated,
                "unparseable release time; using today's date"
            );
        }

        let feed_url = self.settings.feed_url(record.feed_id());
        let channel = normalize_channel(
            document,
            &ChannelValues {
                title: &record.feed.channel_title,
                description: &record.feed.channel_description,
                site_url: &self.settings.site_url,
                feed_url: &feed_url,
                image_url: &record.feed.image_url,
                last_build_date: &pub_date.text,
            },
        )?;
        if channel.duplicates_removed > 0 {
            warn!(
                browser = record.name(),
                removed = channel.duplicates_removed,
                "removed duplicate channel elements"
            );
        }

        let outcome = merge_item(document, record, &pub_date.text)?;
        match outcome {
            MergeOutcome::Updated { .. } => {
                info!(browser = record.name(), version = %record.version, "version already in RSS feed")
            }
            MergeOutcome::Inserted => {
                info!(browser = record.name(), version = %record.version, "RSS feed updated with new version")
            }
        }

        Ok(MergeReport {
            outcome,
            channel,
            pub_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bofa_core::{BrowserFeedConfig, RawRelease};
    use bofa_storage::{empty_feed_document, FeedStore};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn chrome_config() -> BrowserFeedConfig {
        BrowserFeedConfig {
            name: "Chrome".into(),
            feed_filename: "chrome_rss.xml".into(),
            channel_title: "BOFA - Chrome RSS Feed".into(),
            channel_description: "Google Chrome for Mac".into(),
            release_notes_url: "https://chromereleases.googleblog.com/".into(),
            item_title: "New Chrome Release".into(),
            image_url: "https://bofa.cocolabs.dev/images/bofa_logo.png".into(),
        }
    }

    fn record(version: &str, download: &str, last_updated: &str) -> ReleaseRecord {
        ReleaseRecord::from_raw(
            chrome_config(),
            &RawRelease {
                short_version: Some(version.into()),
                update_download: Some(download.into()),
                last_updated: Some(last_updated.into()),
            },
        )
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).single().unwrap()
    }

    fn channel(doc: &XmlDocument) -> &XmlElement {
        doc.root.child("channel").unwrap()
    }

    fn items(doc: &XmlDocument) -> Vec<&XmlElement> {
        channel(doc).children_named("item").collect()
    }

    const SINGLETONS: [&str; 9] = [
        "title",
        "link",
        "description",
        "docs",
        "language",
        "ttl",
        "lastBuildDate",
        "atom:link",
        "image",
    ];

    fn assert_singletons(doc: &XmlDocument) {
        for name in SINGLETONS {
            assert_eq!(
                channel(doc).children_named(name).count(),
                1,
                "expected exactly one <{name}>"
            );
        }
    }

    #[test]
    fn first_release_creates_feed_from_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = FeedStore::new(dir.path());
        let engine = MergeEngine::default();
        let path = "latest_chrome_files/chrome_rss.xml";

        store.ensure(path).unwrap();
        let mut doc = store.load(path).unwrap();
        let report = engine
            .apply_at(
                &mut doc,
                &record("120.0.1", "https://x/120.pkg", "June 1, 2024 09:00 AM EDT"),
                now(),
            )
            .unwrap();
        store.save(&doc, path).unwrap();

        assert_eq!(report.outcome, MergeOutcome::Inserted);
        let saved = store.load(path).unwrap();
        assert_eq!(saved.root.children_named("channel").count(), 1);
        assert_singletons(&saved);

        let items = items(&saved);
        assert_eq!(items.len(), 1);
        let guid = items[0].child("guid").unwrap();
        assert_eq!(guid.text(), "https://x/120.pkg");
        assert_eq!(guid.attribute("isPermaLink"), Some("false"));
        assert!(items[0]
            .child_text("description")
            .unwrap()
            .contains("Version: 120.0.1"));
        assert_eq!(
            items[0].child_text("pubDate").as_deref(),
            Some("Sat, 01 Jun 2024 09:00:00 +0000")
        );
    }

    #[test]
    fn fresh_channel_layout_matches_feed_shape() {
        let mut doc = empty_feed_document();
        MergeEngine::default()
            .apply_at(
                &mut doc,
                &record("120.0.1", "https://x/120.pkg", "June 1, 2024"),
                now(),
            )
            .unwrap();

        let names: Vec<&str> = channel(&doc).elements().map(|el| el.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "title",
                "link",
                "description",
                "docs",
                "atom:link",
                "language",
                "ttl",
                "lastBuildDate",
                "image",
                "item"
            ]
        );
        let atom = channel(&doc).child("atom:link").unwrap();
        assert_eq!(
            atom.attribute("href"),
            Some("https://bofa.cocolabs.dev/rss_feeds/chrome_rss.xml")
        );
        assert_eq!(atom.attribute("type"), Some("application/rss+xml"));
        let image = channel(&doc).child("image").unwrap();
        assert_eq!(
            image.child_text("url").as_deref(),
            Some("https://bofa.cocolabs.dev/images/bofa_logo.png")
        );
        assert_eq!(image.child_text("title").as_deref(), Some("BOFA - Chrome RSS Feed"));
    }

    #[test]
    fn repeated_version_refreshes_without_duplicating() {
        let engine = MergeEngine::default();
        let mut doc = empty_feed_document();
        engine
            .apply_at(
                &mut doc,
                &record("120.0.1", "https://x/120.pkg", "June 1, 2024 09:00 AM EDT"),
                now(),
            )
            .unwrap();

        let report = engine
            .apply_at(
                &mut doc,
                &record("120.0.1", "https://x/120.pkg", "June 3, 2024 11:15 PM EDT"),
                now(),
            )
            .unwrap();

        assert_eq!(report.outcome, MergeOutcome::Updated { index: 0 });
        let items = items(&doc);
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].child_text("pubDate").as_deref(),
            Some("Sat, 01 Jun 2024 09:00:00 +0000")
        );
        assert_eq!(
            items[0].child_text("description").unwrap(),
            render_description("120.0.1", "https://chromereleases.googleblog.com/")
        );
        assert_eq!(
            channel(&doc).child_text("lastBuildDate").as_deref(),
            Some("Mon, 03 Jun 2024 23:15:00 +0000")
        );
    }

    #[test]
    fn applying_same_record_many_times_is_idempotent() {
        let engine = MergeEngine::default();
        let rec = record("121.0.2", "https://x/121.pkg", "July 2, 2024 08:00 AM EDT");

        let mut once = empty_feed_document();
        engine.apply_at(&mut once, &rec, now()).unwrap();

        let mut many = empty_feed_document();
        for _ in 0..5 {
            engine.apply_at(&mut many, &rec, now()).unwrap();
        }
        assert_eq!(once, many);
        assert_eq!(
            once.to_xml_string().unwrap(),
            many.to_xml_string().unwrap()
        );
    }

    #[test]
    fn newer_release_goes_on_top() {
        let engine = MergeEngine::default();
        let mut doc = empty_feed_document();
        for (version, when) in [
            ("120.0.1", "June 1, 2024"),
            ("121.0.2", "July 2, 2024"),
            ("120.0.1", "June 1, 2024"),
            ("122.0.0", "August 9, 2024"),
        ] {
            engine
                .apply_at(
                    &mut doc,
                    &record(version, &format!("https://x/{version}.pkg"), when),
                    now(),
                )
                .unwrap();
        }

        let links: Vec<String> = items(&doc)
            .iter()
            .map(|item| item.child_text("link").unwrap())
            .collect();
        assert_eq!(
            links,
            vec![
                "https://x/122.0.0.pkg",
                "https://x/121.0.2.pkg",
                "https://x/120.0.1.pkg"
            ]
        );
        assert_singletons(&doc);
    }

    #[test]
    fn duplicate_channel_links_are_collapsed() {
        let mut doc = XmlDocument::parse(
            r#"<rss version="2.0">
  <channel>
    <title>Old</title>
    <link>https://bofa.cocolabs.dev/rss_feeds/chrome_rss.xml</link>
    <description>Old</description>
    <link>https://example.com/legacy</link>
    <item>
      <title>New Chrome Release</title>
      <link>https://x/119.pkg</link>
      <description>Version: 119.0.0</description>
    </item>
    <link>https://example.com/stray</link>
  </channel>
</rss>"#,
        )
        .unwrap();

        let report = MergeEngine::default()
            .apply_at(
                &mut doc,
                &record("120.0.1", "https://x/120.pkg", "June 1, 2024"),
                now(),
            )
            .unwrap();

        assert_eq!(report.channel.duplicates_removed, 2);
        let links: Vec<_> = channel(&doc).children_named("link").collect();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].text(), DEFAULT_SITE_URL);
        assert_eq!(channel(&doc).position_of("link"), Some(1));
        assert_eq!(doc.root.attribute("xmlns:atom"), Some(ATOM_NAMESPACE));
        assert_singletons(&doc);
        assert_eq!(items(&doc).len(), 2);
    }

    #[test]
    fn duplicates_of_every_singleton_kind_are_collapsed() {
        let mut doc = XmlDocument::parse(
            r#"<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>First</title>
    <title>Second</title>
    <atom:link href="https://old.example/chrome_rss.xml" rel="self" type="application/rss+xml"/>
    <atom:link href="https://stale.example/chrome_rss.xml"/>
    <ttl>30</ttl>
    <image>
      <url>https://old/logo.png</url>
      <title>Old</title>
    </image>
    <image>
      <url>https://stale/logo.png</url>
    </image>
    <item>
      <title>New Chrome Release</title>
      <link>https://x/119.pkg</link>
      <description>Version: 119.0.0</description>
    </item>
    <ttl>90</ttl>
  </channel>
</rss>"#,
        )
        .unwrap();
        let engine = MergeEngine::default();
        let rec = record("120.0.1", "https://x/120.pkg", "June 1, 2024 09:00 AM EDT");

        let report = engine.apply_at(&mut doc, &rec, now()).unwrap();
        assert_eq!(report.channel.duplicates_removed, 4);
        assert_singletons(&doc);
        assert_eq!(channel(&doc).child_text("title").as_deref(), Some("BOFA - Chrome RSS Feed"));
        assert_eq!(channel(&doc).child_text("ttl").as_deref(), Some(CHANNEL_TTL));
        assert_eq!(
            channel(&doc).child("image").unwrap().child_text("url").as_deref(),
            Some("https://old/logo.png")
        );
        assert_eq!(
            channel(&doc).child("atom:link").unwrap().attribute("href"),
            Some("https://bofa.cocolabs.dev/rss_feeds/chrome_rss.xml")
        );
        assert_eq!(items(&doc).len(), 2);

        let dir = tempdir().expect("tempdir");
        let store = FeedStore::new(dir.path());
        store.save(&doc, "chrome_rss.xml").unwrap();
        let first = std::fs::read(dir.path().join("chrome_rss.xml")).unwrap();

        let mut reloaded = store.load("chrome_rss.xml").unwrap();
        let again = engine.apply_at(&mut reloaded, &rec, now()).unwrap();
        assert_eq!(again.channel.duplicates_removed, 0);
        assert!(!store.save(&reloaded, "chrome_rss.xml").unwrap().changed);
        assert_eq!(std::fs::read(dir.path().join("chrome_rss.xml")).unwrap(), first);
    }

    #[test]
    fn missing_metadata_is_inserted_above_existing_items() {
        let mut doc = XmlDocument::parse(
            "<rss><channel><item><title>New Chrome Release</title>\
             <description>Version: 119.0.0</description></item></channel></rss>",
        )
        .unwrap();
        MergeEngine::default()
            .apply_at(
                &mut doc,
                &record("119.0.0", "https://x/119.pkg", "May 2, 2024"),
                now(),
            )
            .unwrap();

        let names: Vec<&str> = channel(&doc).elements().map(|el| el.name.as_str()).collect();
        assert_eq!(names.last(), Some(&"item"));
        assert_eq!(names.iter().filter(|n| **n == "item").count(), 1);
        assert_eq!(channel(&doc).position_of("image"), Some(8));
    }

    #[test]
    fn existing_image_keeps_its_position_and_gets_site_link() {
        let mut doc = XmlDocument::parse(
            "<rss><channel><image><url>https://old/logo.png</url><title>Old</title></image>\
             <title>BOFA</title></channel></rss>",
        )
        .unwrap();
        MergeEngine::default()
            .apply_at(
                &mut doc,
                &record("120.0.1", "https://x/120.pkg", "June 1, 2024"),
                now(),
            )
            .unwrap();

        assert_eq!(channel(&doc).position_of("image"), Some(0));
        let image = channel(&doc).child("image").unwrap();
        assert_eq!(image.child_text("url").as_deref(), Some("https://old/logo.png"));
        assert_eq!(image.child_text("link").as_deref(), Some(DEFAULT_SITE_URL));
    }

    #[test]
    fn version_inside_nested_description_markup_counts_as_present() {
        let mut doc = XmlDocument::parse(
            "<rss><channel><item><title>New Chrome Release</title>\
             <description>Version: <b>120.0.1</b></description>\
             <pubDate>Sat, 01 Jun 2024 09:00:00 +0000</pubDate></item></channel></rss>",
        )
        .unwrap();
        let report = MergeEngine::default()
            .apply_at(
                &mut doc,
                &record("120.0.1", "https://x/120.pkg", "June 9, 2024"),
                now(),
            )
            .unwrap();

        assert_eq!(report.outcome, MergeOutcome::Updated { index: 0 });
        let item = items(&doc)[0];
        assert_eq!(item.child("description").unwrap().elements().count(), 0);
        assert_eq!(
            item.child_text("pubDate").as_deref(),
            Some("Sat, 01 Jun 2024 09:00:00 +0000")
        );
    }

    #[test]
    fn version_prefix_matches_longer_version() {
        // Substring matching: "1.2" is considered present once "1.2.3" is recorded.
        let engine = MergeEngine::default();
        let mut doc = empty_feed_document();
        engine
            .apply_at(&mut doc, &record("1.2.3", "https://x/1.2.3.pkg", "June 1, 2024"), now())
            .unwrap();
        let report = engine
            .apply_at(&mut doc, &record("1.2", "https://x/1.2.pkg", "June 1, 2024"), now())
            .unwrap();
        assert_eq!(report.outcome, MergeOutcome::Updated { index: 0 });
        assert_eq!(items(&doc).len(), 1);
    }

    #[test]
    fn unparseable_release_time_still_merges() {
        let mut doc = empty_feed_document();
        let report = MergeEngine::default()
            .apply_at(&mut doc, &record("120.0.1", "https://x/120.pkg", "N/A"), now())
            .unwrap();
        assert!(report.pub_date.is_fallback());
        assert_eq!(
            items(&doc)[0].child_text("pubDate").as_deref(),
            Some("Wed, 04 Mar 2026 00:00:00 +0000")
        );
    }

    #[test]
    fn rss_root_without_channel_gets_one() {
        let mut doc = XmlDocument::parse(r#"<rss version="2.0"/>"#).unwrap();
        let report = MergeEngine::default()
            .apply_at(&mut doc, &record("120.0.1", "https://x/120.pkg", ""), now())
            .unwrap();
        assert!(report.channel.channel_created);
        assert_singletons(&doc);
    }

    #[test]
    fn non_rss_documents_are_rejected_untouched() {
        let mut doc = XmlDocument::parse("<feed><entry/></feed>").unwrap();
        let before = doc.clone();
        let err = MergeEngine::default()
            .apply_at(&mut doc, &record("120.0.1", "https://x/120.pkg", ""), now())
            .unwrap_err();
        assert!(matches!(err, FeedError::NotAFeed(root) if root == "feed"));
        assert_eq!(doc, before);
    }

    #[test]
    fn saved_feed_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = FeedStore::new(dir.path());
        let engine = MergeEngine::new(EngineSettings {
            site_url: "https://mirror.example/".into(),
            feed_base_url: "https://mirror.example/feeds/".into(),
        });

        let mut doc = empty_feed_document();
        for version in ["120.0.1", "121.0.2"] {
            engine
                .apply_at(
                    &mut doc,
                    &record(version, &format!("https://x/{version}.pkg"), "June 1, 2024"),
                    now(),
                )
                .unwrap();
        }

        store.save(&doc, "chrome_rss.xml").unwrap();
        let loaded = store.load("chrome_rss.xml").unwrap();
        assert_eq!(loaded, doc);
        let again = store.save(&loaded, "chrome_rss.xml").unwrap();
        assert!(!again.changed);
        assert_eq!(
            channel(&loaded).child("atom:link").unwrap().attribute("href"),
            Some("https://mirror.example/feeds/chrome_rss.xml")
        );
    }
}
