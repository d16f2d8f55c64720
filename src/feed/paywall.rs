//! Best-effort paywall heuristics.
//!
//! A `true` result means markers were found; `false` does not guarantee the
//! content is free.

use scraper::{Html, Selector};

/// URL path fragments used by publishers for subscriber-only articles.
const RESTRICTED_PATHS: &[&str] = &["/premium/", "/subscriber/", "/prime/"];

/// Phrases in a title or description that flag restricted content.
const RESTRICTED_TEXT: &[&str] = &[
    "paywall",
    "subscription required",
    "login required",
    "members only",
    "subscribers only",
];

/// CSS selectors for paywall overlays and metering containers.
const PAYWALL_ELEMENTS: &str = "[class*='paywall'], [id*='paywall'], [class*='piano-'], \
     [class*='metered'], [class*='subscriber-only'], [data-paywall]";

/// Script sources of common metering vendors.
const METERING_SCRIPTS: &[&str] = &["tinypass.com", "piano.io", "poool.fr", "zephr", "laterpay"];

const PAYWALL_PHRASES: &[&str] = &[
    "subscribe to continue reading",
    "subscribe to read",
    "this article is for subscribers",
    "already a subscriber",
    "to continue reading, please",
    "become a member to read",
];

/// Below this many characters of body text, an article ending in a
/// subscribe prompt is treated as truncated.
const TRUNCATED_BODY_CHARS: usize = 600;

/// Cheap check on feed metadata; runs for every ingested item.
pub fn looks_restricted(url: Option<&str>, title: &str, description: Option<&str>) -> bool {
    if let Some(url) = url {
        let url = url.to_ascii_lowercase();
        if RESTRICTED_PATHS.iter().any(|p| url.contains(p)) {
            return true;
        }
    }

    let text = format!("{} {}", title, description.unwrap_or_default()).to_lowercase();
    RESTRICTED_TEXT.iter().any(|needle| text.contains(needle))
}

/// Inspect a fetched article page for paywall markers.
pub fn detect_paywall(html: &str) -> bool {
    let lower = html.to_lowercase();

    if PAYWALL_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }

    // schema.org paywalled-content markup
    if lower.contains("\"isaccessibleforfree\": false")
        || lower.contains("\"isaccessibleforfree\":false")
        || lower.contains("\"isaccessibleforfree\": \"false\"")
        || lower.contains("\"isaccessibleforfree\":\"false\"")
    {
        return true;
    }

    let document = Html::parse_document(html);

    if let Ok(selector) = Selector::parse(PAYWALL_ELEMENTS) {
        if document.select(&selector).next().is_some() {
            return true;
        }
    }

    if let Ok(selector) = Selector::parse("script[src]") {
        let metered = document
            .select(&selector)
            .filter_map(|s| s.value().attr("src"))
            .any(|src| {
                let src = src.to_ascii_lowercase();
                METERING_SCRIPTS.iter().any(|vendor| src.contains(vendor))
            });
        if metered {
            return true;
        }
    }

    is_truncated_body(&document)
}

/// A short article body followed by a link to a subscribe page.
fn is_truncated_body(document: &Html) -> bool {
    let (Ok(body), Ok(subscribe)) = (
        Selector::parse("article, .article-body, .entry-content, .post-content"),
        Selector::parse("a[href*='subscribe'], a[href*='/join'], a[href*='signup']"),
    ) else {
        return false;
    };

    document.select(&body).next().is_some_and(|article| {
        let chars: usize = article.text().map(|t| t.trim().chars().count()).sum();
        chars < TRUNCATED_BODY_CHARS && article.select(&subscribe).next().is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_restricted_by_path() {
        assert!(looks_restricted(
            Some("https://economictimes.indiatimes.com/prime/media/story.cms"),
            "Streaming wars",
            None
        ));
        assert!(looks_restricted(
            Some("https://example.com/Subscriber/news"),
            "News",
            None
        ));
        assert!(!looks_restricted(
            Some("https://example.com/news/premium-tv"),
            "News",
            None
        ));
    }

    #[test]
    fn test_looks_restricted_by_text() {
        assert!(looks_restricted(None, "Members Only: Q3 numbers", None));
        assert!(looks_restricted(
            None,
            "Q3 numbers",
            Some("Subscription required to read the full analysis")
        ));
        assert!(!looks_restricted(
            Some("https://digiday.com/media/cookies/"),
            "Publishers and cookies",
            Some("Ad revenue is shifting.")
        ));
    }

    #[test]
    fn test_detect_paywall_phrase() {
        let html = "<html><body><p>Subscribe to continue reading.</p></body></html>";
        assert!(detect_paywall(html));
    }

    #[test]
    fn test_detect_paywall_schema_org() {
        let html = r#"<script type="application/ld+json">{"@type":"NewsArticle","isAccessibleForFree": false}</script>"#;
        assert!(detect_paywall(html));
    }

    #[test]
    fn test_detect_paywall_overlay_class() {
        let html = r#"<div class="article-paywall-overlay">Hidden</div>"#;
        assert!(detect_paywall(html));
    }

    #[test]
    fn test_detect_paywall_metering_script() {
        let html = r#"<script src="https://cdn.tinypass.com/api/tinypass.min.js"></script>"#;
        assert!(detect_paywall(html));
    }

    #[test]
    fn test_detect_truncated_body() {
        let html = r#"<article><p>The first paragraph only.</p>
            <a href="/subscribe?ref=article">Get full access</a></article>"#;
        assert!(detect_paywall(html));
    }

    #[test]
    fn test_free_article_not_flagged() {
        let body = "Plenty of freely readable text. ".repeat(40);
        let html = format!(
            r#"<html><body><article><p>{body}</p><a href="/subscribe">Newsletter</a></article></body></html>"#
        );
        assert!(!detect_paywall(&html));
    }
}
