//! quantloop: natural-language data analysis with a self-repairing execution loop.
//!
//! A request flows leaf to root:
//!
//! ```text
//! user request → conversation → llm (synthesis) → parser → versions (commit)
//!              → engine (execute + validate) → retry (repair loop on failure)
//! ```
//!
//! `session::Session` bundles the per-interaction state so no component
//! reaches for shared globals.

pub mod config;
pub mod conversation;
pub mod data;
pub mod engine;
pub mod error;
pub mod llm;
pub mod parser;
pub mod retry;
pub mod session;
pub mod versions;

#[cfg(test)]
pub(crate) mod testing;

/// Target language of generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    Python,
    Shell,
}

impl CodeLanguage {
    /// Info-string tags accepted on a fenced code block for this language.
    pub fn fence_tags(&self) -> &'static [&'static str] {
        match self {
            CodeLanguage::Python => &["python", "py", "python3"],
            CodeLanguage::Shell => &["bash", "sh", "shell"],
        }
    }

    /// File extension used when persisting generated code.
    pub fn extension(&self) -> &'static str {
        match self {
            CodeLanguage::Python => "py",
            CodeLanguage::Shell => "sh",
        }
    }

    /// Parse a language name from a string.
    pub fn from_str_lc(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "python" | "py" => Ok(CodeLanguage::Python),
            "shell" | "bash" | "sh" => Ok(CodeLanguage::Shell),
            _ => Err(format!("unknown language: '{s}'")),
        }
    }
}

impl std::fmt::Display for CodeLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeLanguage::Python => write!(f, "python"),
            CodeLanguage::Shell => write!(f, "shell"),
        }
    }
}
