use crate::model::{DIFF_HEADER_RE, HUNK_HEADER_RE};
use cip_core::{AstSpan, ValidationError};
use std::collections::{BTreeSet, HashMap};

/// Edit-scope policy for one candidate diff.
#[derive(Debug, Clone)]
pub struct ValidationLimits<'a> {
    pub allowed_files: &'a BTreeSet<String>,
    pub max_loc: usize,
    pub max_files: usize,
    pub target_spans: &'a [AstSpan],
    pub padding_lines: usize,
    pub allow_api_change: bool,
}

/// Ensure the string looks like a unified diff before any deeper checks.
pub fn require_unified_diff(diff: &str) -> Result<(), ValidationError> {
    if !diff.starts_with("diff --git") {
        return Err(ValidationError("Diff must start with 'diff --git'.".to_string()));
    }
    if !diff.contains("@@") {
        return Err(ValidationError("Diff must contain a hunk header '@@'.".to_string()));
    }
    for line in diff.lines() {
        let stripped = line.trim();
        if (stripped.starts_with("+def") || stripped.starts_with("+class")) && stripped.ends_with("::") {
            return Err(ValidationError(
                "Suspicious double-colon in definition header.".to_string(),
            ));
        }
    }
    Ok(())
}

fn touched_files(diff: &str) -> BTreeSet<String> {
    diff.lines()
        .filter_map(|line| DIFF_HEADER_RE.captures(line))
        .map(|caps| caps[2].to_string())
        .collect()
}

fn count_changed_loc(diff: &str) -> usize {
    diff.lines()
        .filter(|line| !line.starts_with("+++ ") && !line.starts_with("--- "))
        .filter(|line| line.starts_with('+') || line.starts_with('-'))
        .count()
}

fn span_map<'a>(
    target_spans: &'a [AstSpan],
    padding: usize,
) -> HashMap<&'a str, Vec<(usize, usize)>> {
    let mut spans: HashMap<&str, Vec<(usize, usize)>> = HashMap::new();
    for span in target_spans {
        let start = span.start_line.saturating_sub(padding).max(1);
        let end = (span.end_line + padding).max(start);
        spans.entry(span.file.as_str()).or_default().push((start, end));
    }
    spans
}

fn line_allowed(spans: &HashMap<&str, Vec<(usize, usize)>>, file: &str, line: usize) -> bool {
    spans
        .get(file)
        .is_some_and(|ranges| ranges.iter().any(|&(start, end)| start <= line && line <= end))
}

/// Check a diff against every configured edit-scope policy.
///
/// Walks the diff with separate old-side and new-side cursors, re-seeded at
/// each hunk header: context lines advance both, deletions advance the old
/// side, additions the new side. Every changed line must land inside the
/// padded target spans of its file.
pub fn ensure_within_limits(diff: &str, limits: &ValidationLimits) -> Result<(), ValidationError> {
    require_unified_diff(diff)?;

    let files = touched_files(diff);
    if files.is_empty() {
        return Err(ValidationError("Diff must touch at least one file header.".to_string()));
    }
    if files.len() > limits.max_files {
        return Err(ValidationError("Diff touches too many files.".to_string()));
    }
    if !files.is_subset(limits.allowed_files) {
        return Err(ValidationError("Diff touches files outside of allowed set.".to_string()));
    }
    if count_changed_loc(diff) > limits.max_loc {
        return Err(ValidationError("Diff changes too many lines.".to_string()));
    }
    let span_files: BTreeSet<&str> = limits.target_spans.iter().map(|s| s.file.as_str()).collect();
    if !files.iter().any(|f| span_files.contains(f.as_str())) {
        return Err(ValidationError(
            "Diff does not touch any target span files.".to_string(),
        ));
    }

    let spans = span_map(limits.target_spans, limits.padding_lines);
    let mut current_file: Option<String> = None;
    let mut old_line: Option<usize> = None;
    let mut new_line: Option<usize> = None;
    let mut removed_defs: BTreeSet<String> = BTreeSet::new();
    let mut added_defs: BTreeSet<String> = BTreeSet::new();

    for line in diff.lines() {
        if let Some(caps) = DIFF_HEADER_RE.captures(line) {
            current_file = Some(caps[2].to_string());
            old_line = None;
            new_line = None;
            removed_defs.clear();
            added_defs.clear();
            continue;
        }
        if line.starts_with("@@") {
            if current_file.is_none() {
                return Err(ValidationError("Hunk appears before diff header.".to_string()));
            }
            let caps = HUNK_HEADER_RE
                .captures(line)
                .ok_or_else(|| ValidationError("Malformed hunk header in diff.".to_string()))?;
            old_line = Some(caps[1].parse().unwrap_or(1));
            new_line = Some(caps[3].parse().unwrap_or(1));
            removed_defs.clear();
            added_defs.clear();
            continue;
        }
        let Some(file) = current_file.as_deref() else {
            continue;
        };
        if line.is_empty() {
            continue;
        }
        // File headers sit between `diff --git` and the first hunk; inside a
        // hunk the same prefixes are genuine body lines.
        if old_line.is_none() && (line.starts_with("--- ") || line.starts_with("+++ ")) {
            continue;
        }
        if line.starts_with(' ') {
            if let Some(n) = old_line.as_mut() {
                *n += 1;
            }
            if let Some(n) = new_line.as_mut() {
                *n += 1;
            }
            continue;
        }
        if line.starts_with('-') {
            let Some(at) = old_line else {
                return Err(ValidationError(
                    "Deletion encountered before hunk header.".to_string(),
                ));
            };
            if !line_allowed(&spans, file, at) {
                return Err(ValidationError(format!(
                    "Deletion at {file}:{at} outside allowed spans."
                )));
            }
            if line.starts_with("-def ") && !limits.allow_api_change {
                removed_defs.insert(line[1..].trim().to_string());
            }
            old_line = Some(at + 1);
            continue;
        }
        if line.starts_with('+') {
            let Some(at) = new_line else {
                return Err(ValidationError(
                    "Addition encountered before hunk header.".to_string(),
                ));
            };
            if !line_allowed(&spans, file, at) {
                return Err(ValidationError(format!(
                    "Addition at {file}:{at} outside allowed spans."
                )));
            }
            if line.starts_with("+def ") && !limits.allow_api_change {
                added_defs.insert(line[1..].trim().to_string());
            }
            new_line = Some(at + 1);
            if !added_defs.is_empty()
                && !removed_defs.is_empty()
                && added_defs != removed_defs
                && !limits.allow_api_change
            {
                return Err(ValidationError(
                    "Public API signature change detected in diff.".to_string(),
                ));
            }
            continue;
        }
        // Anything else (e.g. "\ No newline at end of file") is ignored.
    }
    Ok(())
}
