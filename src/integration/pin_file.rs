//! Reading and rewriting `KEY = "value"` assignments in the pin file.

use std::fs;
use std::path::Path;

use regex::Regex;

use crate::steps::StepError;

fn assignment(key: &str) -> Result<Regex, StepError> {
    Regex::new(&format!(r#"(?m)^([ \t]*{}[ \t]*=[ \t]*")([^"\n]*)(")"#, regex::escape(key)))
        .map_err(|e| StepError::InvalidValue(format!("bad pin key {key:?}: {e}")))
}

fn is_commit_id(value: &str) -> bool {
    value.len() == 40 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// The single value assigned to `key`.
pub fn read_value(content: &str, key: &str) -> Result<String, StepError> {
    let re = assignment(key)?;
    let mut matches = re.captures_iter(content);
    let value = match (matches.next(), matches.next()) {
        (Some(caps), None) => caps[2].to_string(),
        (None, _) => {
            return Err(StepError::InvalidValue(format!(
                "no `{key} = \"...\"` assignment found"
            )))
        }
        (Some(_), Some(_)) => {
            return Err(StepError::InvalidValue(format!(
                "more than one `{key}` assignment found"
            )))
        }
    };
    Ok(value)
}

/// Replace the value assigned to `key`. Exactly one assignment must exist.
pub fn rewrite_value(content: &str, key: &str, value: &str) -> Result<String, StepError> {
    read_value(content, key)?;
    let re = assignment(key)?;
    let rewritten = re.replace(content, |caps: &regex::Captures| {
        format!("{}{}{}", &caps[1], value, &caps[3])
    });
    Ok(rewritten.into_owned())
}

fn read_file(path: &Path) -> Result<String, StepError> {
    fs::read_to_string(path).map_err(|e| StepError::io(path, format!("reading {}", path.display()), e))
}

/// Read the pinned upstream commit. It must be a full 40-digit hex id.
pub fn read_pinned_commit(path: &Path, commit_key: &str) -> Result<String, StepError> {
    let commit = read_value(&read_file(path)?, commit_key)?;
    if !is_commit_id(&commit) {
        return Err(StepError::InvalidValue(format!(
            "{commit_key} in {} is {commit:?}, expected a 40 digit commit id",
            path.display()
        )));
    }
    Ok(commit)
}

/// Point the pin file at `commit` with archive checksum `checksum`.
pub fn write_pin(
    path: &Path,
    commit_key: &str,
    commit: &str,
    checksum_key: &str,
    checksum: &str,
) -> Result<(), StepError> {
    let content = read_file(path)?;
    let content = rewrite_value(&content, commit_key, commit)?;
    let content = rewrite_value(&content, checksum_key, checksum)?;
    fs::write(path, content).map_err(|e| StepError::io(path, format!("writing {}", path.display()), e))
}
