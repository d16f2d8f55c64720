//! Utility functions shared by the ingestion pipeline and admin commands.
//!
//! - **Text cleanup**: turning feed HTML fragments into bounded plain text
//! - **URL policy**: validating feed URLs before they become sources

mod text;
mod url_validator;

pub use text::{clean_text, collapse_whitespace, strip_control_chars, truncate_chars};
pub use url_validator::{validate_source_url, UrlPolicyError};

/// Maximum length of a stored content description, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 500;
