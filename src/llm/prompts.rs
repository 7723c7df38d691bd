//! Prompt templates for code synthesis.
//!
//! Two concerns live here:
//! - the role prompt per target language (tag protocol + injected capabilities)
//! - the context block that carries current code and the last error ahead of
//!   the literal request, so a repair needs one call instead of a negotiation

use crate::CodeLanguage;

/// Response protocol shared by every role prompt.
const TAG_PROTOCOL: &str = "\
Answer using these tagged sections:
- <explanation>...</explanation>: a short plain-language description of what the code does.
- <code>...</code>: the complete program. Always send the whole program, never a diff.
- <clarification>...</clarification>: ONLY if the request is too ambiguous to implement. \
When you ask for clarification, do not send code.

Output contract: the program must write exactly one CSV file with a `date` column \
(YYYY-MM-DD) and one numeric signal column. Drop rows with missing values before writing. \
Write the file to OUTPUT_DIR using the file name OUTPUT_NAME.";

const PYTHON_ROLE: &str = "\
You are a quantitative analyst who writes Python data-analysis programs.

The following names are already defined when your program runs. Do not redefine them:
- load_data(symbol=DEFAULT_SYMBOL, start_date=START_DATE, end_date=END_DATE): returns a \
pandas DataFrame with columns date, open, high, low, close, volume.
- DEFAULT_SYMBOL, START_DATE, END_DATE: the default symbol and date range.
- OUTPUT_DIR, OUTPUT_NAME: where to write the result CSV.
pandas is imported as pd and numpy as np when available. There is no network access.";

const SHELL_ROLE: &str = "\
You are a quantitative analyst who writes bash data-analysis scripts using awk and coreutils.

The following are already defined when your script runs:
- load_data [SYMBOL] [START] [END]: prints CSV with header date,open,high,low,close,volume \
to stdout. Arguments default to DEFAULT_SYMBOL, START_DATE and END_DATE.
- $DEFAULT_SYMBOL, $START_DATE, $END_DATE: the default symbol and date range.
- $OUTPUT_DIR, $OUTPUT_NAME: where to write the result CSV.
The script runs with `set -euo pipefail`. There is no network access.";

/// Role prompt for the target language.
pub fn role_prompt(language: CodeLanguage) -> String {
    let role = match language {
        CodeLanguage::Python => PYTHON_ROLE,
        CodeLanguage::Shell => SHELL_ROLE,
    };
    format!("{role}\n\n{TAG_PROTOCOL}")
}

/// Prefix `request` with the current code and last error, when present.
pub fn compose_user_message(
    request: &str,
    current_code: Option<&str>,
    last_error: Option<&str>,
) -> String {
    let Some(code) = current_code else {
        return request.to_string();
    };

    let mut msg = String::new();
    msg.push_str("<current_code>\n");
    msg.push_str(code.trim_end());
    msg.push_str("\n</current_code>\n");
    if let Some(err) = last_error {
        msg.push_str("<last_error>\n");
        msg.push_str(err.trim_end());
        msg.push_str("\n</last_error>\n");
    }
    msg.push_str("<request>\n");
    msg.push_str(request);
    msg.push_str("\n</request>");
    msg
}

/// Literal request sent for an automatic repair.
pub fn repair_request(attempt: u32, max_attempts: u32) -> String {
    format!(
        "The current code failed when executed (attempt {attempt} of {max_attempts}). \
         Fix the error shown in <last_error> and return the complete corrected program \
         in a <code> block. Keep the original intent of the program."
    )
}
