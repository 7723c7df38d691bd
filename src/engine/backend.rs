//! Language backends: how to turn a script into a child process.
//!
//! A backend contributes a prelude that binds the injected capabilities
//! (`load_data`, default range, output location) and the command used to
//! run the combined script. Adding a language means adding a backend; the
//! engine and its callers stay untouched.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tokio::process::Command;

use crate::CodeLanguage;

/// The fixed, named capability set handed to one execution.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub output_name: String,
    pub default_symbol: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl Capabilities {
    /// Environment for the child. Nothing else from the parent leaks in
    /// except `PATH`.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("QL_DATA_DIR", self.data_dir.display().to_string()),
            ("OUTPUT_DIR", self.output_dir.display().to_string()),
            ("OUTPUT_NAME", self.output_name.clone()),
            ("DEFAULT_SYMBOL", self.default_symbol.clone()),
            ("START_DATE", self.start_date.format("%Y-%m-%d").to_string()),
            ("END_DATE", self.end_date.format("%Y-%m-%d").to_string()),
        ]
    }
}

/// Uniform contract every language runtime implements.
pub trait LanguageBackend: Send + Sync {
    fn language(&self) -> CodeLanguage;

    /// File name of the script inside the run directory.
    fn script_name(&self) -> &'static str;

    /// Source prepended to the generated code.
    fn prelude(&self) -> &'static str;

    /// Command that runs `script`.
    fn command(&self, script: &Path) -> Command;

    /// Full script text: prelude, then the generated code.
    fn render(&self, code: &str) -> String {
        format!("{}\n{}\n", self.prelude().trim_end(), code.trim_end())
    }
}

const PYTHON_PRELUDE: &str = r#"import os as _ql_os
import csv as _ql_csv

QL_DATA_DIR = _ql_os.environ["QL_DATA_DIR"]
DEFAULT_SYMBOL = _ql_os.environ["DEFAULT_SYMBOL"]
START_DATE = _ql_os.environ["START_DATE"]
END_DATE = _ql_os.environ["END_DATE"]
OUTPUT_DIR = _ql_os.environ["OUTPUT_DIR"]
OUTPUT_NAME = _ql_os.environ["OUTPUT_NAME"]

try:
    import pandas as pd
    import numpy as np
except ImportError:
    pd = None
    np = None


def load_data(symbol=None, start_date=None, end_date=None):
    symbol = (symbol or DEFAULT_SYMBOL).upper()
    start = str(start_date or START_DATE)[:10]
    end = str(end_date or END_DATE)[:10]
    path = _ql_os.path.join(QL_DATA_DIR, symbol + ".csv")
    if not _ql_os.path.exists(path):
        available = sorted(f[:-4] for f in _ql_os.listdir(QL_DATA_DIR) if f.endswith(".csv"))
        raise ValueError("no data for symbol %r; available: %s" % (symbol, ", ".join(available)))
    if pd is not None:
        df = pd.read_csv(path, parse_dates=["date"])
        mask = (df["date"] >= pd.Timestamp(start)) & (df["date"] <= pd.Timestamp(end))
        return df.loc[mask].reset_index(drop=True)
    with open(path, newline="") as fh:
        return [row for row in _ql_csv.DictReader(fh) if start <= row["date"] <= end]
"#;

const SHELL_PRELUDE: &str = r#"set -euo pipefail

load_data() {
  local symbol="${1:-$DEFAULT_SYMBOL}"
  local start="${2:-$START_DATE}"
  local end="${3:-$END_DATE}"
  symbol="$(printf '%s' "$symbol" | tr '[:lower:]' '[:upper:]')"
  local file="$QL_DATA_DIR/$symbol.csv"
  if [ ! -f "$file" ]; then
    echo "load_data: no data for symbol '$symbol'" >&2
    return 1
  fi
  awk -F, -v s="$start" -v e="$end" 'NR == 1 || ($1 >= s && $1 <= e)' "$file"
}
"#;

/// CPython 3 via `python3`.
#[derive(Debug, Default)]
pub struct PythonBackend;

impl LanguageBackend for PythonBackend {
    fn language(&self) -> CodeLanguage {
        CodeLanguage::Python
    }

    fn script_name(&self) -> &'static str {
        "main.py"
    }

    fn prelude(&self) -> &'static str {
        PYTHON_PRELUDE
    }

    fn command(&self, script: &Path) -> Command {
        let mut cmd = Command::new("python3");
        cmd.arg("-u").arg(script);
        cmd
    }
}

/// bash with coreutils and awk.
/// Uses bash (not sh/dash) because the prelude relies on `set -o pipefail`.
#[derive(Debug, Default)]
pub struct ShellBackend;

impl LanguageBackend for ShellBackend {
    fn language(&self) -> CodeLanguage {
        CodeLanguage::Shell
    }

    fn script_name(&self) -> &'static str {
        "main.sh"
    }

    fn prelude(&self) -> &'static str {
        SHELL_PRELUDE
    }

    fn command(&self, script: &Path) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg(script);
        cmd
    }
}
