use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::parser::CandidateItem;
use crate::util::{clean_text, MAX_DESCRIPTION_CHARS};

/// Maximum number of candidates taken from one page.
pub const MAX_HTML_ITEMS: usize = 20;

const BLOCK_SELECTOR: &str = "article, .post, .entry";
const HEADING_SELECTOR: &str = "h1, h2, h3, h4";
const LINK_SELECTOR: &str = "a[href]";
const PARAGRAPH_SELECTOR: &str = "p";

/// Extract post candidates from a blog index page.
///
/// Every `article`, `.post` or `.entry` block yields one candidate from its
/// first heading and first link. Blocks nested inside another matched block
/// are ignored. Returns the candidates (at most [`MAX_HTML_ITEMS`]) and the
/// number of blocks that had neither a title nor a link.
pub fn extract_html_items(html: &str, base_url: Option<&Url>) -> (Vec<CandidateItem>, usize) {
    let (Ok(blocks), Ok(headings), Ok(links), Ok(paragraphs)) = (
        Selector::parse(BLOCK_SELECTOR),
        Selector::parse(HEADING_SELECTOR),
        Selector::parse(LINK_SELECTOR),
        Selector::parse(PARAGRAPH_SELECTOR),
    ) else {
        return (Vec::new(), 0);
    };

    let document = Html::parse_document(html);
    let mut items: Vec<CandidateItem> = Vec::new();
    let mut skipped = 0;

    for block in document.select(&blocks) {
        if items.len() >= MAX_HTML_ITEMS {
            break;
        }
        if has_matching_ancestor(block, &blocks) {
            continue;
        }

        let heading = block.select(&headings).next();
        let title = heading
            .map(|h| clean_text(&h.text().collect::<String>(), MAX_DESCRIPTION_CHARS))
            .unwrap_or_default();

        // Prefer the link inside the heading; fall back to the block's first link
        let href = heading
            .and_then(|h| h.select(&links).next())
            .or_else(|| block.select(&links).next())
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|h| !h.is_empty() && !h.starts_with('#'));
        let link = href.map(|h| resolve_link(h, base_url));

        if title.is_empty() && link.is_none() {
            skipped += 1;
            continue;
        }
        if link.is_some() && items.iter().any(|i| i.link == link) {
            continue;
        }

        let description = block
            .select(&paragraphs)
            .map(|p| clean_text(&p.text().collect::<String>(), MAX_DESCRIPTION_CHARS))
            .find(|text| !text.is_empty());

        items.push(CandidateItem {
            title,
            link,
            description,
            ..CandidateItem::default()
        });
    }

    (items, skipped)
}

fn has_matching_ancestor(element: ElementRef<'_>, selector: &Selector) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| selector.matches(&ancestor))
}

/// Resolve `href` against `base`. Absolute URLs are normalized through the
/// URL parser; anything unresolvable is returned as-is.
pub(crate) fn resolve_link(href: &str, base: Option<&Url>) -> String {
    // Protocol-relative
    if let Some(rest) = href.strip_prefix("//") {
        let scheme = base.map(Url::scheme).unwrap_or("https");
        if let Ok(parsed) = Url::parse(&format!("{scheme}://{rest}")) {
            return parsed.to_string();
        }
    }

    match (Url::parse(href), base) {
        (Ok(url), _) => url.to_string(),
        (Err(url::ParseError::RelativeUrlWithoutBase), Some(base)) => base
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_owned()),
        _ => href.to_owned(),
    }
}
