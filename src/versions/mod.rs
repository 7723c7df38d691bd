//! Version Store: append-only log of code artifacts plus a movable cursor.
//!
//! Artifacts are never mutated or removed. `revert` only moves the cursor;
//! a commit after a revert appends a new version past the end of the log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::CodeLanguage;

/// How an artifact came into being.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactOrigin {
    /// First code produced for a request.
    Generated,
    /// User asked to change existing code.
    Edit,
    /// Produced by the retry loop after a failed execution.
    AutoFix,
}

impl std::fmt::Display for ArtifactOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactOrigin::Generated => write!(f, "generated"),
            ArtifactOrigin::Edit => write!(f, "edit"),
            ArtifactOrigin::AutoFix => write!(f, "auto-fix"),
        }
    }
}

/// One immutable, versioned unit of generated code.
#[derive(Debug, Clone, Serialize)]
pub struct CodeArtifact {
    /// 1-based, strictly increasing.
    pub version: u32,
    pub code: String,
    pub language: CodeLanguage,
    pub description: String,
    pub origin: ArtifactOrigin,
    pub created_at: DateTime<Utc>,
}

/// Append-only artifact log.
#[derive(Debug)]
pub struct VersionStore {
    language: CodeLanguage,
    log: Vec<CodeArtifact>,
    /// Index into `log`; `None` while empty.
    cursor: Option<usize>,
}

impl VersionStore {
    pub fn new(language: CodeLanguage) -> Self {
        Self {
            language,
            log: Vec::new(),
            cursor: None,
        }
    }

    /// Append the next-numbered artifact and point the cursor at it.
    pub fn commit(
        &mut self,
        code: impl Into<String>,
        description: impl Into<String>,
        origin: ArtifactOrigin,
    ) -> &CodeArtifact {
        let version = self.log.len() as u32 + 1;
        let artifact = CodeArtifact {
            version,
            code: code.into(),
            language: self.language,
            description: description.into(),
            origin,
            created_at: Utc::now(),
        };
        info!(version, %origin, "committed code artifact");
        self.log.push(artifact);
        self.cursor = Some(self.log.len() - 1);
        &self.log[self.log.len() - 1]
    }

    /// The artifact under the cursor.
    pub fn current(&self) -> Option<&CodeArtifact> {
        self.cursor.map(|i| &self.log[i])
    }

    /// Move the cursor back one version. No-op at version 1 or when empty.
    pub fn revert(&mut self) -> Option<&CodeArtifact> {
        if let Some(i) = self.cursor {
            if i > 0 {
                self.cursor = Some(i - 1);
                info!(version = i, "reverted to previous version");
            }
        }
        self.current()
    }

    pub fn get(&self, version: u32) -> Option<&CodeArtifact> {
        if version == 0 {
            return None;
        }
        self.log.get(version as usize - 1)
    }

    /// Every artifact ever committed, oldest first.
    pub fn history(&self) -> &[CodeArtifact] {
        &self.log
    }

    pub fn language(&self) -> CodeLanguage {
        self.language
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}
