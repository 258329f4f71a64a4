/*!
Capture cleaning and validation.

A capture must be non-empty, plausibly complete and well-formed for the
device's export format before it is allowed into the artifact store.
*/

use once_cell::sync::Lazy;
use regex::Regex;

use crate::device::DeviceKind;
use crate::{Result, VaultError};

/// `FGT60F # `, `FGT60F (global) # `, `router$`
static CLI_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._-]+( \([^)]*\))? ?[#$>]\s*$").expect("prompt pattern is valid")
});

/// True when `line` looks like an interactive CLI prompt
pub fn is_cli_prompt(line: &str) -> bool {
    CLI_PROMPT.is_match(line.trim())
}

/// Strip session noise from interactive CLI output
///
/// Everything before the first `#config-version=` or `config ` line is
/// dropped, then prompt lines, `--More--` pagination markers and echoes of
/// `command` are removed, along with trailing blank lines.
pub fn clean_cli_output(raw: &str, command: &str) -> String {
    let mut cleaned: Vec<&str> = Vec::new();
    let mut started = false;

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        // Pagination leaves the marker and backspaces/carriage returns in the stream
        let line = line.trim_start_matches(['\u{8}', '\r']).trim_end();
        let stripped = line.trim();

        if !started {
            if stripped.starts_with("#config-version=") || stripped.starts_with("config ") {
                started = true;
                cleaned.push(line);
            }
            continue;
        }

        if stripped.contains("--More--") || CLI_PROMPT.is_match(stripped) || stripped == command {
            continue;
        }
        if !stripped.is_empty() || !cleaned.is_empty() {
            cleaned.push(line);
        }
    }

    while cleaned.last().map_or(false, |l| l.trim().is_empty()) {
        cleaned.pop();
    }

    let mut out = cleaned.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Reject empty, truncated or malformed captures
pub fn validate_capture(kind: DeviceKind, content: &[u8], min_bytes: usize) -> Result<()> {
    if content.iter().all(u8::is_ascii_whitespace) {
        return Err(VaultError::validation("capture is empty"));
    }
    let text = std::str::from_utf8(content)
        .map_err(|e| VaultError::validation(format!("capture is not valid UTF-8: {e}")))?;
    if text.contains('\0') {
        return Err(VaultError::validation("capture contains NUL bytes"));
    }
    let trimmed = text.trim();
    if trimmed.len() < min_bytes {
        return Err(VaultError::validation(format!(
            "capture seems incomplete ({} bytes, expected at least {min_bytes})",
            trimmed.len()
        )));
    }

    match kind {
        DeviceKind::Fortigate => validate_fortigate(text),
        DeviceKind::Generic => Ok(()),
    }
}

/// `config` blocks must be balanced by `end`, and the export must contain at least one
fn validate_fortigate(text: &str) -> Result<()> {
    let mut depth: usize = 0;
    let mut blocks = 0;

    for (idx, line) in text.lines().enumerate() {
        let token = line.trim();
        if token.starts_with("config ") {
            depth += 1;
            blocks += 1;
        } else if token == "end" {
            depth = depth.checked_sub(1).ok_or_else(|| {
                VaultError::validation(format!("unexpected 'end' at line {}", idx + 1))
            })?;
        }
    }

    if blocks == 0 {
        return Err(VaultError::validation(
            "capture contains no configuration blocks",
        ));
    }
    if depth != 0 {
        return Err(VaultError::validation(format!(
            "capture is truncated: {depth} unterminated config block(s)"
        )));
    }
    Ok(())
}
