use std::borrow::Cow;

use scraper::Html;

/// Suffix appended when [`truncate_chars`] cuts a string.
const ELLIPSIS: &str = "...";

/// Reduces an HTML fragment from a feed to plain, single-spaced text.
///
/// Tags are dropped (text nodes are kept), control characters removed,
/// whitespace runs collapsed to one space, and the result capped at
/// `max_chars` characters.
///
/// # Examples
///
/// ```
/// use media_monitor::util::clean_text;
///
/// assert_eq!(clean_text("<p>Hello <b>world</b></p>\n\n", 100), "Hello world");
/// assert_eq!(clean_text("abcdef", 3), "abc...");
/// ```
pub fn clean_text(fragment: &str, max_chars: usize) -> String {
    let text = if fragment.contains('<') {
        let parsed = Html::parse_fragment(fragment);
        parsed.root_element().text().collect::<Vec<_>>().join(" ")
    } else {
        fragment.to_owned()
    };

    let stripped = strip_control_chars(&text);
    let collapsed = collapse_whitespace(&stripped);
    truncate_chars(&collapsed, max_chars).into_owned()
}

/// Collapses every run of Unicode whitespace into a single ASCII space and
/// trims both ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncates to at most `max_chars` characters (not bytes), appending "..."
/// when anything was cut.
///
/// Returns `Cow::Borrowed` when the input already fits.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        None => Cow::Borrowed(s),
        Some((cut, _)) => Cow::Owned(format!("{}{}", s[..cut].trim_end(), ELLIPSIS)),
    }
}

/// Removes ASCII control characters (including ESC) while keeping tab,
/// newline and carriage return.
///
/// Feed text is attacker-controlled and ends up in logs and terminal output.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let is_unwanted = |c: char| c.is_ascii_control() && !matches!(c, '\t' | '\n' | '\r');

    if !s.chars().any(is_unwanted) {
        return Cow::Borrowed(s);
    }

    Cow::Owned(s.chars().filter(|c| !is_unwanted(*c)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_strips_tags_and_entities() {
        let input = "<p>Streaming &amp; <a href=\"/x\">podcasts</a></p><p>grow</p>";
        assert_eq!(clean_text(input, 500), "Streaming & podcasts grow");
    }

    #[test]
    fn test_clean_text_plain_input_untouched() {
        assert_eq!(clean_text("Plain title", 500), "Plain title");
    }

    #[test]
    fn test_clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  a \n\n\t b   c ", 500), "a b c");
    }

    #[test]
    fn test_truncate_chars_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_chars("short", 10), "short");
        assert!(matches!(truncate_chars("short", 5), Cow::Borrowed(_)));
    }

    #[test]
    fn test_truncate_chars_trims_before_ellipsis() {
        assert_eq!(truncate_chars("one two three", 4), "one...");
    }

    #[test]
    fn test_strip_control_chars() {
        assert_eq!(strip_control_chars("a\x1b[31mb\x07c"), "a[31mbc");
        assert_eq!(strip_control_chars("keep\ttab\nnewline"), "keep\ttab\nnewline");
        assert!(matches!(strip_control_chars("clean"), Cow::Borrowed(_)));
    }
}
