//! Response Parser: pulls tagged sections out of free-text synthesis output.
//!
//! The service is asked to answer with `<explanation>`, `<code>` and
//! `<clarification>` blocks, but nothing enforces that. Every extraction
//! here degrades to `None` on malformed or missing tags; nothing panics
//! and nothing returns an error.

use crate::CodeLanguage;

const TAGS: [&str; 3] = ["explanation", "code", "clarification"];

/// Structured view of one synthesis response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub explanation: Option<String>,
    pub code: Option<String>,
    pub clarification: Option<String>,
}

impl ParsedResponse {
    /// True when the response carries neither code nor a question back.
    pub fn is_conversational(&self) -> bool {
        self.code.is_none() && self.clarification.is_none()
    }
}

/// Parse a raw response for the given target language.
pub fn parse_response(text: &str, language: CodeLanguage) -> ParsedResponse {
    let clarification = extract_tag(text, "clarification");

    // A clarification wins over any code that came along with it.
    let code = if clarification.is_some() {
        None
    } else {
        extract_tag(text, "code")
            .map(|c| strip_fence(&c))
            .filter(|c| !c.is_empty())
            .or_else(|| extract_fenced(text, language))
    };

    let explanation = extract_tag(text, "explanation").or_else(|| {
        let stripped = strip_structure(text, language);
        if stripped.is_empty() {
            None
        } else {
            Some(stripped)
        }
    });

    ParsedResponse {
        explanation,
        code,
        clarification,
    }
}

/// Text between the first `<tag>` and the next `</tag>`, trimmed.
/// Unterminated or empty sections yield `None`.
fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let (start, end) = tag_span(text, tag)?;
    let inner = text[start..end].trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

/// Byte range of the content of the first complete `<tag>...</tag>` section.
fn tag_span(text: &str, tag: &str) -> Option<(usize, usize)> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some((start, end))
}

/// Find a fenced block whose info string names the target language.
fn extract_fenced(text: &str, language: CodeLanguage) -> Option<String> {
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find("```") {
        let fence_start = search_from + pos;
        let info_start = fence_start + 3;
        let line_end = match text[info_start..].find('\n') {
            Some(i) => info_start + i,
            None => return None,
        };
        let info = text[info_start..line_end].trim().to_lowercase();
        let body_start = line_end + 1;
        let body_end = match text[body_start..].find("```") {
            Some(i) => body_start + i,
            None => return None,
        };

        if language.fence_tags().contains(&info.as_str()) {
            let body = text[body_start..body_end].trim();
            if !body.is_empty() {
                return Some(body.to_string());
            }
        }
        search_from = body_end + 3;
    }
    None
}

/// Remove a Markdown fence wrapped around code inside a `<code>` tag.
fn strip_fence(code: &str) -> String {
    let trimmed = code.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let after_info = match trimmed.find('\n') {
        Some(i) => &trimmed[i + 1..],
        None => return String::new(),
    };
    after_info
        .trim_end()
        .strip_suffix("```")
        .unwrap_or(after_info)
        .trim()
        .to_string()
}

/// The response minus code sections and structural tag markers.
fn strip_structure(text: &str, language: CodeLanguage) -> String {
    let mut out = text.to_string();

    while let Some((start, end)) = tag_span(&out, "code") {
        let open_at = start - "<code>".len();
        let close_end = end + "</code>".len();
        out.replace_range(open_at..close_end, "");
    }

    if let Some(code) = extract_fenced(&out, language) {
        if let Some(pos) = out.find(&code) {
            let fence_open = out[..pos].rfind("```").unwrap_or(pos);
            let fence_close = out[pos + code.len()..]
                .find("```")
                .map(|i| pos + code.len() + i + 3)
                .unwrap_or(pos + code.len());
            out.replace_range(fence_open..fence_close, "");
        }
    }

    for tag in TAGS {
        out = out
            .replace(&format!("<{tag}>"), "")
            .replace(&format!("</{tag}>"), "");
    }
    out.trim().to_string()
}
