use cip_core::ValidationError;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

pub(crate) static DIFF_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(\S+) b/(\S+)").expect("diff header regex"));

pub(crate) static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Removed,
    Added,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyLine {
    pub kind: LineKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: Option<usize>,
    pub new_start: usize,
    pub new_count: Option<usize>,
    pub lines: Vec<BodyLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<Hunk>,
}

/// A parsed unified diff. The parser is lenient where generators are
/// sloppy: `---`/`+++` headers and hunk counts may be absent, and a
/// trailing `\ No newline at end of file` marker is consumed silently.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    pub files: Vec<FileDiff>,
}

impl Patch {
    pub fn parse(diff: &str) -> Result<Self, ValidationError> {
        let mut files: Vec<FileDiff> = Vec::new();
        for line in diff.lines() {
            if let Some(caps) = DIFF_HEADER_RE.captures(line) {
                files.push(FileDiff {
                    old_path: caps[1].to_string(),
                    new_path: caps[2].to_string(),
                    hunks: Vec::new(),
                });
                continue;
            }
            let Some(current) = files.last_mut() else {
                continue;
            };
            if line.starts_with("--- ") || line.starts_with("+++ ") {
                continue;
            }
            if line.starts_with("@@") {
                let caps = HUNK_HEADER_RE
                    .captures(line)
                    .ok_or_else(|| ValidationError("Malformed hunk header in diff.".to_string()))?;
                current.hunks.push(Hunk {
                    old_start: caps[1].parse().unwrap_or(1),
                    old_count: caps.get(2).map(|m| m.as_str().parse().unwrap_or(0)),
                    new_start: caps[3].parse().unwrap_or(1),
                    new_count: caps.get(4).map(|m| m.as_str().parse().unwrap_or(0)),
                    lines: Vec::new(),
                });
                continue;
            }
            let Some(hunk) = current.hunks.last_mut() else {
                continue;
            };
            if line.starts_with('\\') {
                continue;
            }
            let (kind, text) = if let Some(rest) = line.strip_prefix('+') {
                (LineKind::Added, rest)
            } else if let Some(rest) = line.strip_prefix('-') {
                (LineKind::Removed, rest)
            } else if let Some(rest) = line.strip_prefix(' ') {
                (LineKind::Context, rest)
            } else if line.is_empty() {
                (LineKind::Context, "")
            } else {
                continue;
            };
            hunk.lines.push(BodyLine {
                kind,
                text: text.to_string(),
            });
        }
        Ok(Self { files })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            out.push_str(&format!("diff --git a/{} b/{}\n", file.old_path, file.new_path));
            out.push_str(&format!("--- a/{}\n", file.old_path));
            out.push_str(&format!("+++ b/{}\n", file.new_path));
            for hunk in &file.hunks {
                let old_count = hunk
                    .old_count
                    .unwrap_or_else(|| hunk.lines.iter().filter(|l| l.kind != LineKind::Added).count());
                let new_count = hunk
                    .new_count
                    .unwrap_or_else(|| hunk.lines.iter().filter(|l| l.kind != LineKind::Removed).count());
                out.push_str(&format!(
                    "@@ -{},{} +{},{} @@\n",
                    hunk.old_start, old_count, hunk.new_start, new_count
                ));
                for line in &hunk.lines {
                    let prefix = match line.kind {
                        LineKind::Context => ' ',
                        LineKind::Removed => '-',
                        LineKind::Added => '+',
                    };
                    out.push(prefix);
                    out.push_str(&line.text);
                    out.push('\n');
                }
            }
        }
        out
    }

    pub fn touched_files(&self) -> BTreeSet<String> {
        self.files.iter().map(|f| f.new_path.clone()).collect()
    }

    pub fn added_lines(&self) -> Vec<String> {
        self.body_lines(LineKind::Added)
    }

    pub fn removed_lines(&self) -> Vec<String> {
        self.body_lines(LineKind::Removed)
    }

    fn body_lines(&self, kind: LineKind) -> Vec<String> {
        let mut lines: Vec<String> = self
            .files
            .iter()
            .flat_map(|f| f.hunks.iter())
            .flat_map(|h| h.lines.iter())
            .filter(|l| l.kind == kind)
            .map(|l| l.text.clone())
            .collect();
        lines.sort();
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "diff --git a/mod.py b/mod.py\n--- a/mod.py\n+++ b/mod.py\n@@ -1,2 +1,2 @@\n-def add(x, y):\n-    return x - y\n+def add(x, y):\n+    return x + y\n";

    #[test]
    fn parse_reads_files_hunks_and_lines() {
        let patch = Patch::parse(SAMPLE).expect("parse");
        assert_eq!(patch.files.len(), 1);
        assert_eq!(patch.files[0].new_path, "mod.py");
        let hunk = &patch.files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.new_start), (1, 1));
        assert_eq!(hunk.lines.len(), 4);
        assert_eq!(patch.added_lines().len(), 2);
        assert_eq!(patch.removed_lines().len(), 2);
    }

    #[test]
    fn parse_tolerates_missing_headers_and_counts() {
        let diff = "diff --git a/mod.py b/mod.py\n@@ -1 +1 @@\n-x\n+y\n";
        let patch = Patch::parse(diff).expect("parse");
        let hunk = &patch.files[0].hunks[0];
        assert_eq!(hunk.old_count, None);
        assert_eq!(patch.added_lines(), vec!["y"]);
    }

    #[test]
    fn parse_consumes_no_newline_marker() {
        let diff = "diff --git a/a.txt b/a.txt\n@@ -1 +1 @@\n-x\n+y\n\\ No newline at end of file\n";
        let patch = Patch::parse(diff).expect("parse");
        assert_eq!(patch.files[0].hunks[0].lines.len(), 2);
    }

    #[test]
    fn parse_rejects_malformed_hunk_header() {
        let diff = "diff --git a/a.txt b/a.txt\n@@ garbage @@\n";
        assert!(Patch::parse(diff).is_err());
    }

    #[test]
    fn round_trip_preserves_files_and_line_multisets() {
        let patch = Patch::parse(SAMPLE).expect("parse");
        let rendered = patch.render();
        let reparsed = Patch::parse(&rendered).expect("reparse");
        assert_eq!(patch.touched_files(), reparsed.touched_files());
        assert_eq!(patch.added_lines(), reparsed.added_lines());
        assert_eq!(patch.removed_lines(), reparsed.removed_lines());
    }

    proptest! {
        #[test]
        fn round_trip_holds_for_generated_hunks(
            old_start in 1usize..500,
            new_start in 1usize..500,
            body in proptest::collection::vec(
                ("[ +-]", "[a-z0-9_ ]{0,20}"),
                1..12,
            ),
        ) {
            let mut diff = String::from("diff --git a/gen.py b/gen.py\n");
            diff.push_str(&format!("@@ -{old_start} +{new_start} @@\n"));
            for (prefix, text) in &body {
                diff.push_str(prefix);
                diff.push_str(text);
                diff.push('\n');
            }
            let patch = Patch::parse(&diff).expect("parse");
            let reparsed = Patch::parse(&patch.render()).expect("reparse");
            prop_assert_eq!(patch.touched_files(), reparsed.touched_files());
            prop_assert_eq!(patch.added_lines(), reparsed.added_lines());
            prop_assert_eq!(patch.removed_lines(), reparsed.removed_lines());
        }
    }
}
