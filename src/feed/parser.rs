use feed_rs::model::Entry;
use feed_rs::parser;
use thiserror::Error;
use url::Url;

use super::html::{extract_html_items, resolve_link};
use crate::storage::{Metrics, SourceType};
use crate::util::{clean_text, MAX_DESCRIPTION_CHARS};

/// Titles longer than this are cut; feeds occasionally put whole posts there.
const MAX_TITLE_CHARS: usize = 300;

/// How a fetched body should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    /// RSS 0.9x/1.0/2.0, Atom or JSON Feed
    Syndication,
    /// RSS with audio enclosures
    PodcastRss,
    /// A blog index page without a feed
    HtmlPage,
}

impl FeedFormat {
    pub fn for_source_type(source_type: SourceType) -> Self {
        match source_type {
            SourceType::Podcast => FeedFormat::PodcastRss,
            _ => FeedFormat::Syndication,
        }
    }
}

/// Why a body produced no entries at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Malformed feed: {0}")]
    Malformed(String),
    #[error("Feed body is empty")]
    Empty,
}

/// One entry from a feed, normalized but not yet deduplicated.
///
/// `title` and `link` are never both empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CandidateItem {
    pub title: String,
    pub link: Option<String>,
    /// Unix seconds
    pub published_at: Option<i64>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub enclosure_url: Option<String>,
    pub metrics: Metrics,
}

/// The result of parsing one body.
#[derive(Debug)]
pub struct ParsedFeed {
    body: ParsedBody,
    error: Option<ParseError>,
}

#[derive(Debug)]
enum ParsedBody {
    Entries {
        entries: Vec<Entry>,
        podcast: bool,
        base: Option<Url>,
    },
    Extracted {
        items: Vec<CandidateItem>,
        skipped: usize,
    },
    Nothing,
}

impl ParsedFeed {
    fn failed(error: ParseError) -> Self {
        Self {
            body: ParsedBody::Nothing,
            error: Some(error),
        }
    }

    /// Lazily converts entries into candidates, skipping unusable ones.
    pub fn items(&self) -> Candidates<'_> {
        let inner = match &self.body {
            ParsedBody::Entries {
                entries,
                podcast,
                base,
            } => CandidateSource::Entries {
                iter: entries.iter(),
                podcast: *podcast,
                base: base.as_ref(),
            },
            ParsedBody::Extracted { items, .. } => CandidateSource::Extracted(items.iter()),
            ParsedBody::Nothing => CandidateSource::Empty,
        };
        let skipped = match &self.body {
            ParsedBody::Extracted { skipped, .. } => *skipped,
            _ => 0,
        };
        Candidates { inner, skipped }
    }

    /// Number of raw entries (feed items or HTML blocks), usable or not.
    pub fn entry_count(&self) -> usize {
        match &self.body {
            ParsedBody::Entries { entries, .. } => entries.len(),
            ParsedBody::Extracted { items, skipped } => items.len() + skipped,
            ParsedBody::Nothing => 0,
        }
    }

    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    pub fn is_html(&self) -> bool {
        matches!(self.body, ParsedBody::Extracted { .. })
    }
}

/// Iterator returned by [`ParsedFeed::items`].
pub struct Candidates<'a> {
    inner: CandidateSource<'a>,
    skipped: usize,
}

enum CandidateSource<'a> {
    Entries {
        iter: std::slice::Iter<'a, Entry>,
        podcast: bool,
        base: Option<&'a Url>,
    },
    Extracted(std::slice::Iter<'a, CandidateItem>),
    Empty,
}

impl Candidates<'_> {
    /// Entries dropped so far for having neither title nor link.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for Candidates<'_> {
    type Item = CandidateItem;

    fn next(&mut self) -> Option<CandidateItem> {
        match &mut self.inner {
            CandidateSource::Entries {
                iter,
                podcast,
                base,
            } => {
                for entry in iter.by_ref() {
                    match entry_to_candidate(entry, *podcast, *base) {
                        Some(item) => return Some(item),
                        None => self.skipped += 1,
                    }
                }
                None
            }
            CandidateSource::Extracted(iter) => iter.next().cloned(),
            CandidateSource::Empty => None,
        }
    }
}

/// Parse a fetched body.
///
/// A body that looks like an HTML document is handed to the HTML extractor
/// whatever `format` says. `base_url` resolves relative links.
/// Never fails: a body that cannot be read yields an empty [`ParsedFeed`]
/// whose [`ParsedFeed::error`] says why.
pub fn parse_feed(bytes: &[u8], format: FeedFormat, base_url: Option<&Url>) -> ParsedFeed {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return ParsedFeed::failed(ParseError::Empty);
    }

    if format == FeedFormat::HtmlPage || looks_like_html(bytes) {
        let html = String::from_utf8_lossy(bytes);
        let (items, skipped) = extract_html_items(&html, base_url);
        return ParsedFeed {
            body: ParsedBody::Extracted { items, skipped },
            error: None,
        };
    }

    match parser::parse(bytes) {
        Ok(feed) => ParsedFeed {
            body: ParsedBody::Entries {
                entries: feed.entries,
                podcast: format == FeedFormat::PodcastRss,
                base: base_url.cloned(),
            },
            error: None,
        },
        Err(e) => ParsedFeed::failed(ParseError::Malformed(e.to_string())),
    }
}

/// Sniff the first bytes for an HTML document rather than XML/JSON.
fn looks_like_html(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    let head = head.trim_start_matches('\u{feff}').trim_start();

    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        return true;
    }
    head.contains("<html") && !(head.contains("<rss") || head.contains("<feed") || head.contains("<rdf"))
}

fn entry_to_candidate(entry: &Entry, podcast: bool, base: Option<&Url>) -> Option<CandidateItem> {
    let title = entry
        .title
        .as_ref()
        .map(|t| clean_text(&t.content, MAX_TITLE_CHARS))
        .unwrap_or_default();
    let link = select_entry_link(entry).map(|href| resolve_link(&href, base));

    if title.is_empty() && link.is_none() {
        return None;
    }

    let published_at = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let author = entry
        .authors
        .iter()
        .map(|p| p.name.trim())
        .find(|name| !name.is_empty())
        .map(str::to_owned);
    let description = entry
        .summary
        .as_ref()
        .map(|s| s.content.as_str())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.as_deref()))
        .map(|raw| clean_text(raw, MAX_DESCRIPTION_CHARS))
        .filter(|d| !d.is_empty());

    let mut metrics = Metrics::new();
    let enclosure_url = if podcast {
        select_audio_enclosure(entry, &mut metrics)
    } else {
        None
    };

    Some(CandidateItem {
        title,
        link,
        published_at,
        author,
        description,
        enclosure_url,
        metrics,
    })
}

/// First non-empty link, preferring `alternate` (or unlabelled) ones over
/// enclosures and self links.
fn select_entry_link(entry: &Entry) -> Option<String> {
    let usable = || entry.links.iter().filter(|l| !l.href.trim().is_empty());

    usable()
        .find(|l| {
            l.rel
                .as_deref()
                .map_or(true, |rel| rel.is_empty() || rel.eq_ignore_ascii_case("alternate"))
        })
        .or_else(|| usable().next())
        .map(|l| l.href.trim().to_owned())
}

/// First `audio/*` media content of the entry; records duration and size.
fn select_audio_enclosure(entry: &Entry, metrics: &mut Metrics) -> Option<String> {
    for media in &entry.media {
        for content in &media.content {
            let is_audio = content
                .content_type
                .as_ref()
                .is_some_and(|ct| ct.essence().to_string().starts_with("audio/"));
            let Some(url) = content.url.as_ref().filter(|_| is_audio) else {
                continue;
            };

            let duration = content.duration.or(media.duration);
            if let Some(secs) = duration.and_then(|d| i64::try_from(d.as_secs()).ok()) {
                metrics.insert("duration_secs".into(), secs);
            }
            if let Some(size) = content.size.and_then(|s| i64::try_from(s).ok()) {
                metrics.insert("enclosure_bytes".into(), size);
            }
            return Some(url.to_string());
        }
    }

    // Some feeds only expose the enclosure as a typed link
    entry
        .links
        .iter()
        .find(|l| {
            l.media_type
                .as_deref()
                .is_some_and(|t| t.starts_with("audio/"))
        })
        .map(|l| {
            // Lengths past i64 are bogus; drop the metric rather than wrap
            if let Some(len) = l.length.and_then(|len| i64::try_from(len).ok()) {
                metrics.insert("enclosure_bytes".into(), len);
            }
            l.href.clone()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Digiday</title>
  <item>
    <title>Publishers &amp; the cookie deadline</title>
    <link>https://digiday.com/media/cookies/</link>
    <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate>
    <author>editor@digiday.com (Sara Guaglione)</author>
    <description><![CDATA[<p>Ad revenue   <b>is</b> shifting.</p>]]></description>
  </item>
  <item>
    <description>Entry with nothing to identify it</description>
  </item>
  <item>
    <link>https://digiday.com/media/untitled/</link>
  </item>
</channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>a16z</title>
  <id>urn:a16z</id>
  <updated>2024-01-02T00:00:00Z</updated>
  <entry>
    <title>Creator economy</title>
    <id>urn:post:1</id>
    <link rel="alternate" href="https://a16z.com/creator-economy/"/>
    <updated>2024-01-02T00:00:00Z</updated>
    <author><name>Li Jin</name></author>
    <summary>The passion economy grows.</summary>
  </entry>
</feed>"#;

    const PODCAST: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
<channel><title>Acquired</title>
  <item>
    <title>Episode 1: Nintendo</title>
    <link>https://acquired.fm/episodes/nintendo</link>
    <guid>ep-1</guid>
    <enclosure url="https://cdn.example.com/ep1.mp3" length="52428800" type="audio/mpeg"/>
    <itunes:duration>01:00:05</itunes:duration>
  </item>
</channel></rss>"#;

    #[test]
    fn test_parse_rss_cleans_and_skips() {
        let feed = parse_feed(RSS.as_bytes(), FeedFormat::Syndication, None);
        assert!(feed.error().is_none());
        assert_eq!(feed.entry_count(), 3);

        let mut items = feed.items();
        let collected: Vec<CandidateItem> = items.by_ref().collect();
        assert_eq!(items.skipped(), 1);
        assert_eq!(collected.len(), 2);

        let first = &collected[0];
        assert_eq!(first.title, "Publishers & the cookie deadline");
        assert_eq!(first.link.as_deref(), Some("https://digiday.com/media/cookies/"));
        assert_eq!(first.published_at, Some(1_704_067_200));
        assert_eq!(first.description.as_deref(), Some("Ad revenue is shifting."));
        assert!(first.author.is_some());

        assert_eq!(collected[1].title, "");
        assert!(collected[1].link.is_some());
    }

    #[test]
    fn test_parse_atom() {
        let feed = parse_feed(ATOM.as_bytes(), FeedFormat::Syndication, None);
        let items: Vec<_> = feed.items().collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Creator economy");
        assert_eq!(items[0].author.as_deref(), Some("Li Jin"));
        assert_eq!(items[0].link.as_deref(), Some("https://a16z.com/creator-economy/"));
        assert_eq!(items[0].description.as_deref(), Some("The passion economy grows."));
    }

    #[test]
    fn test_parse_podcast_enclosure_and_metrics() {
        let feed = parse_feed(PODCAST.as_bytes(), FeedFormat::PodcastRss, None);
        let items: Vec<_> = feed.items().collect();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].enclosure_url.as_deref(),
            Some("https://cdn.example.com/ep1.mp3")
        );
        assert_eq!(items[0].metrics.get("enclosure_bytes"), Some(&52_428_800));
        assert_eq!(items[0].metrics.get("duration_secs"), Some(&3605));
    }

    #[test]
    fn test_oversized_enclosure_length_is_dropped() {
        let rss = r#"<rss version="2.0"><channel><title>Show</title>
          <item>
            <title>Episode 2</title>
            <enclosure url="https://cdn.example.com/ep2.mp3" length="18446744073709551615" type="audio/mpeg"/>
          </item>
        </channel></rss>"#;
        let feed = parse_feed(rss.as_bytes(), FeedFormat::PodcastRss, None);
        let items: Vec<_> = feed.items().collect();
        assert_eq!(
            items[0].enclosure_url.as_deref(),
            Some("https://cdn.example.com/ep2.mp3")
        );
        assert_eq!(items[0].metrics.get("enclosure_bytes"), None);
    }

    #[test]
    fn test_syndication_format_ignores_enclosures() {
        let feed = parse_feed(PODCAST.as_bytes(), FeedFormat::Syndication, None);
        let items: Vec<_> = feed.items().collect();
        assert_eq!(items[0].enclosure_url, None);
        assert!(items[0].metrics.is_empty());
    }

    #[test]
    fn test_description_truncated_to_limit() {
        let long = "word ".repeat(300);
        let rss = format!(
            r#"<rss version="2.0"><channel><item><title>T</title><description>{long}</description></item></channel></rss>"#
        );
        let feed = parse_feed(rss.as_bytes(), FeedFormat::Syndication, None);
        let item = feed.items().next().unwrap();
        let description = item.description.unwrap();
        assert!(description.ends_with("..."));
        assert!(description.chars().count() <= MAX_DESCRIPTION_CHARS + 3);
    }

    #[test]
    fn test_malformed_body_yields_error_not_panic() {
        let feed = parse_feed(b"<not valid xml", FeedFormat::Syndication, None);
        assert!(matches!(feed.error(), Some(ParseError::Malformed(_))));
        assert_eq!(feed.items().count(), 0);
    }

    #[test]
    fn test_empty_body() {
        let feed = parse_feed(b"  \n ", FeedFormat::Syndication, None);
        assert_eq!(feed.error(), Some(&ParseError::Empty));
    }

    #[test]
    fn test_html_body_sniffed() {
        let html = br#"<!DOCTYPE html><html><body>
            <article><h2><a href="/posts/one">First post</a></h2></article>
        </body></html>"#;
        let base = Url::parse("https://blog.example.com/").unwrap();
        let feed = parse_feed(html, FeedFormat::Syndication, Some(&base));

        assert!(feed.is_html());
        let items: Vec<_> = feed.items().collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link.as_deref(), Some("https://blog.example.com/posts/one"));
    }

    #[test]
    fn test_relative_feed_links_resolved() {
        let rss = r#"<rss version="2.0"><channel><item><title>T</title><link>/p/1</link></item></channel></rss>"#;
        let base = Url::parse("https://example.com/feed.xml").unwrap();
        let feed = parse_feed(rss.as_bytes(), FeedFormat::Syndication, Some(&base));
        let item = feed.items().next().unwrap();
        assert_eq!(item.link.as_deref(), Some("https://example.com/p/1"));
    }

    fn xml_escape(s: &str) -> String {
        s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
    }

    proptest! {
        #[test]
        fn prop_candidates_never_lack_both_title_and_link(
            entries in proptest::collection::vec(
                (proptest::option::of("[ a-zA-Z0-9<>&]{0,12}"), proptest::option::of("[a-z]{0,8}")),
                0..8,
            ),
            format in prop_oneof![Just(FeedFormat::Syndication), Just(FeedFormat::PodcastRss)],
            atom in any::<bool>(),
        ) {
            let body = if atom {
                let mut s = String::from(r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>t</title><id>urn:f</id><updated>2024-01-01T00:00:00Z</updated>"#);
                for (i, (title, slug)) in entries.iter().enumerate() {
                    s.push_str(&format!("<entry><id>urn:e:{i}</id><updated>2024-01-01T00:00:00Z</updated>"));
                    if let Some(t) = title { s.push_str(&format!("<title>{}</title>", xml_escape(t))); }
                    if let Some(slug) = slug { s.push_str(&format!(r#"<link href="https://example.com/{slug}"/>"#)); }
                    s.push_str("</entry>");
                }
                s.push_str("</feed>");
                s
            } else {
                let mut s = String::from(r#"<rss version="2.0"><channel><title>t</title>"#);
                for (title, slug) in &entries {
                    s.push_str("<item>");
                    if let Some(t) = title { s.push_str(&format!("<title>{}</title>", xml_escape(t))); }
                    if let Some(slug) = slug { s.push_str(&format!("<link>https://example.com/{slug}</link>")); }
                    s.push_str("</item>");
                }
                s.push_str("</channel></rss>");
                s
            };

            let feed = parse_feed(body.as_bytes(), format, None);
            let mut items = feed.items();
            let mut yielded = 0;
            for item in items.by_ref() {
                prop_assert!(!item.title.is_empty() || item.link.as_deref().is_some_and(|l| !l.is_empty()));
                yielded += 1;
            }
            prop_assert_eq!(yielded + items.skipped(), feed.entry_count());
        }
    }
}
