//! Output discovery: find the tabular file a run produced.
//!
//! Patterns are tried from most to least specific; within the first tier
//! that matches anything, the most recently modified file wins.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::Pattern;
use tracing::debug;

/// Which pattern located the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    /// `<indicator>_<timestamp>.csv`, the name handed to the code.
    Exact,
    /// `<indicator>*.csv`
    Indicator,
    /// `output*.csv`
    Generic,
    /// Any `*.csv`.
    AnyTabular,
}

/// Search `dirs` for the output of one run.
pub fn find_output(
    dirs: &[PathBuf],
    indicator: &str,
    exact_name: &str,
) -> Option<(PathBuf, MatchTier)> {
    let indicator = Pattern::escape(indicator);
    let tiers = [
        (MatchTier::Exact, Pattern::escape(exact_name)),
        (MatchTier::Indicator, format!("{indicator}*.csv")),
        (MatchTier::Generic, "output*.csv".to_string()),
        (MatchTier::AnyTabular, "*.csv".to_string()),
    ];

    for (tier, file_pattern) in tiers {
        let newest = dirs
            .iter()
            .flat_map(|dir| matches_in(dir, &file_pattern))
            .max_by_key(|(_, modified)| *modified);
        if let Some((path, _)) = newest {
            debug!(?tier, path = %path.display(), "located output file");
            return Some((path, tier));
        }
    }
    None
}

fn matches_in(dir: &Path, file_pattern: &str) -> Vec<(PathBuf, SystemTime)> {
    let Some(dir_str) = dir.to_str() else {
        return Vec::new();
    };
    let pattern = format!("{}/{}", Pattern::escape(dir_str), file_pattern);
    let Ok(paths) = glob::glob(&pattern) else {
        return Vec::new();
    };
    paths
        .filter_map(|p| p.ok())
        .filter(|p| p.is_file())
        .filter_map(|p| {
            let modified = p.metadata().and_then(|m| m.modified()).ok()?;
            Some((p, modified))
        })
        .collect()
}
