use crate::errors::{MirrorError, MirrorResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone)]
pub struct PatchHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<PatchLine>,
    /// `\ No newline at end of file` after the last old-side line
    pub old_missing_newline: bool,
    /// `\ No newline at end of file` after the last new-side line
    pub new_missing_newline: bool,
}

impl PatchHunk {
    pub fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            PatchLine::Context(s) | PatchLine::Remove(s) => Some(s.as_str()),
            PatchLine::Add(_) => None,
        })
    }

    pub fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            PatchLine::Context(s) | PatchLine::Add(s) => Some(s.as_str()),
            PatchLine::Remove(_) => None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<PatchHunk>,
    pub is_new_file: bool,
    pub is_deleted_file: bool,
    pub is_binary: bool,
}

impl FilePatch {
    /// Path used for reporting: the new path unless the file is deleted.
    pub fn display_path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or("<unknown>")
    }

    pub fn is_rename(&self) -> bool {
        matches!((&self.old_path, &self.new_path), (Some(a), Some(b)) if a != b)
    }
}

#[derive(Debug)]
pub struct ParsedPatch {
    pub files: Vec<FilePatch>,
}

fn invalid(reason: impl Into<String>, line_number: usize) -> MirrorError {
    MirrorError::validation(
        "patch",
        format!("{} (patch line {})", reason.into(), line_number),
    )
}

impl ParsedPatch {
    /// Parse unified diff text, with or without `diff --git` headers.
    pub fn from_diff(diff_content: &str) -> MirrorResult<Self> {
        // Keep '\r' so CRLF files round-trip; only '\n' separates lines.
        let lines: Vec<&str> = diff_content
            .split_inclusive('\n')
            .map(|l| l.strip_suffix('\n').unwrap_or(l))
            .collect();
        let mut files = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let starts_plain = lines[i].starts_with("--- ")
                && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "));
            if lines[i].starts_with("diff --git ") || starts_plain {
                let (file_patch, next_index) = Self::parse_file_patch(&lines, i)?;
                files.push(file_patch);
                i = next_index;
            } else {
                i += 1;
            }
        }

        if files.is_empty() {
            return Err(MirrorError::validation(
                "patch",
                "no file headers ('---'/'+++' or 'diff --git') found",
            ));
        }
        Ok(ParsedPatch { files })
    }

    fn parse_file_patch(lines: &[&str], start: usize) -> MirrorResult<(FilePatch, usize)> {
        let mut i = start;
        let mut patch = FilePatch::default();

        if let Some(rest) = lines[i].strip_prefix("diff --git ") {
            if let Some((a, b)) = rest.trim_end().split_once(' ') {
                patch.old_path = header_path(a, "a/");
                patch.new_path = header_path(b, "b/");
            }
            i += 1;
            while i < lines.len()
                && !lines[i].starts_with("--- ")
                && !lines[i].starts_with("@@")
                && !lines[i].starts_with("diff --git ")
            {
                let line = lines[i].trim_end();
                if line.starts_with("new file mode") {
                    patch.is_new_file = true;
                } else if line.starts_with("deleted file mode") {
                    patch.is_deleted_file = true;
                } else if let Some(from) = line.strip_prefix("rename from ") {
                    patch.old_path = Some(from.to_string());
                } else if let Some(to) = line.strip_prefix("rename to ") {
                    patch.new_path = Some(to.to_string());
                } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
                    patch.is_binary = true;
                }
                i += 1;
            }
        }

        if i < lines.len() && lines[i].starts_with("--- ") {
            patch.old_path = header_path(&lines[i][4..], "a/");
            i += 1;
            match lines.get(i).and_then(|l| l.strip_prefix("+++ ")) {
                Some(rest) => {
                    patch.new_path = header_path(rest, "b/");
                    i += 1;
                }
                None => return Err(invalid("'---' header without '+++'", i + 1)),
            }
            if patch.old_path.is_none() {
                patch.is_new_file = true;
            }
            if patch.new_path.is_none() {
                patch.is_deleted_file = true;
            }
        }

        while i < lines.len() && lines[i].starts_with("@@") {
            let (hunk, next_index) = Self::parse_hunk(lines, i)?;
            patch.hunks.push(hunk);
            i = next_index;
        }

        if patch.old_path.is_none() && patch.new_path.is_none() {
            return Err(invalid("file patch without any path", start + 1));
        }
        Ok((patch, i))
    }

    fn parse_hunk(lines: &[&str], start: usize) -> MirrorResult<(PatchHunk, usize)> {
        let hunk_header = lines[start];

        // @@ -old_start,old_count +new_start,new_count @@ optional section
        let parts: Vec<&str> = hunk_header.split_whitespace().collect();
        if parts.len() < 3 || !parts[1].starts_with('-') || !parts[2].starts_with('+') {
            return Err(invalid(
                format!("invalid hunk header: {}", hunk_header.trim_end()),
                start + 1,
            ));
        }
        let (old_start, old_count) = parse_range(&parts[1][1..], start + 1)?;
        let (new_start, new_count) = parse_range(&parts[2][1..], start + 1)?;

        let mut hunk = PatchHunk {
            old_start,
            old_count,
            new_start,
            new_count,
            lines: Vec::new(),
            old_missing_newline: false,
            new_missing_newline: false,
        };
        let (mut old_left, mut new_left) = (old_count, new_count);
        let mut i = start + 1;

        // Counts, not prefixes, decide where the hunk ends: a removed line
        // may itself start with "--".
        while i < lines.len() && (old_left > 0 || new_left > 0) {
            let line = lines[i];
            if line.starts_with('\\') {
                mark_missing_newline(&mut hunk);
                i += 1;
                continue;
            }
            match line.chars().next() {
                Some(' ') | None if old_left > 0 && new_left > 0 => {
                    hunk.lines
                        .push(PatchLine::Context(line.get(1..).unwrap_or("").to_string()));
                    old_left -= 1;
                    new_left -= 1;
                }
                Some('-') if old_left > 0 => {
                    hunk.lines.push(PatchLine::Remove(line[1..].to_string()));
                    old_left -= 1;
                }
                Some('+') if new_left > 0 => {
                    hunk.lines.push(PatchLine::Add(line[1..].to_string()));
                    new_left -= 1;
                }
                _ => {
                    return Err(invalid(
                        format!(
                            "unexpected line in hunk (expected {} old / {} new more)",
                            old_left, new_left
                        ),
                        i + 1,
                    ))
                }
            }
            i += 1;
        }

        if old_left > 0 || new_left > 0 {
            return Err(invalid("hunk truncated before its declared length", i));
        }
        if i < lines.len() && lines[i].starts_with('\\') {
            mark_missing_newline(&mut hunk);
            i += 1;
        }

        Ok((hunk, i))
    }
}

fn mark_missing_newline(hunk: &mut PatchHunk) {
    match hunk.lines.last() {
        Some(PatchLine::Remove(_)) => hunk.old_missing_newline = true,
        Some(PatchLine::Add(_)) => hunk.new_missing_newline = true,
        Some(PatchLine::Context(_)) => {
            hunk.old_missing_newline = true;
            hunk.new_missing_newline = true;
        }
        None => {}
    }
}

/// `a/src/x.rs\t2024-01-01 ...` -> `src/x.rs`; `/dev/null` -> None.
fn header_path(raw: &str, prefix: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim_end();
    if path == "/dev/null" || path.is_empty() {
        return None;
    }
    Some(path.strip_prefix(prefix).unwrap_or(path).to_string())
}

fn parse_range(range: &str, line_number: usize) -> MirrorResult<(usize, usize)> {
    let parse = |value: &str| {
        value
            .parse::<usize>()
            .map_err(|_| invalid(format!("invalid hunk range: {}", range), line_number))
    };
    match range.split_once(',') {
        Some((start, count)) => Ok((parse(start)?, parse(count)?)),
        None => Ok((parse(range)?, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_git_and_plain_headers() {
        let git = "diff --git a/src/lib.rs b/src/lib.rs\nindex 1..2 100644\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,2 +1,2 @@\n-old\n+new\n ctx\n";
        let parsed = ParsedPatch::from_diff(git).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].new_path.as_deref(), Some("src/lib.rs"));
        assert_eq!(parsed.files[0].hunks[0].lines.len(), 3);

        let plain = "--- a.txt\t2024-01-01\n+++ a.txt\n@@ -1 +1 @@\n-x\n+y\n";
        let parsed = ParsedPatch::from_diff(plain).unwrap();
        assert_eq!(parsed.files[0].old_path.as_deref(), Some("a.txt"));
    }

    #[test]
    fn new_and_deleted_files() {
        let diff = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+a\n+b\n--- a/gone.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n";
        let parsed = ParsedPatch::from_diff(diff).unwrap();
        assert!(parsed.files[0].is_new_file);
        assert!(parsed.files[1].is_deleted_file);
        assert_eq!(parsed.files[1].old_path.as_deref(), Some("gone.txt"));
    }

    #[test]
    fn removed_line_starting_with_dashes_stays_in_hunk() {
        let diff = "--- a/x.md\n+++ b/x.md\n@@ -1,2 +1,1 @@\n--- rule\n keep\n";
        let parsed = ParsedPatch::from_diff(diff).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(
            parsed.files[0].hunks[0].lines[0],
            PatchLine::Remove("-- rule".to_string())
        );
    }

    #[test]
    fn no_newline_marker() {
        let diff = "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n\\ No newline at end of file\n";
        let parsed = ParsedPatch::from_diff(diff).unwrap();
        let hunk = &parsed.files[0].hunks[0];
        assert!(hunk.old_missing_newline);
        assert!(hunk.new_missing_newline);
    }

    #[test]
    fn truncated_hunk_is_rejected() {
        let diff = "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n";
        assert!(ParsedPatch::from_diff(diff).unwrap_err().is_validation());
        assert!(ParsedPatch::from_diff("just text").is_err());
    }
}
