//! Helpers for keeping filesystem layout out of span attributes and
//! client-visible error text.

use std::collections::VecDeque;
use std::path::Path;

/// Returns only the filename component of a path (no directory).
///
/// Safe for span fields: reveals the file name without exposing the full path.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Replaces every occurrence of `root` inside `text` with `<storage>`.
///
/// Error causes written into status records are read by clients; the
/// server-side storage location is not theirs to see.
pub fn strip_root(text: &str, root: &Path) -> String {
    let root = root.to_string_lossy();
    let root = root.trim_end_matches(std::path::MAIN_SEPARATOR);
    if root.is_empty() {
        return text.to_string();
    }
    text.replace(root, "<storage>")
}

/// Keeps at most the last `max_lines` of `lines`, joined with newlines.
/// Consumes the iterator without buffering more than the tail.
pub fn tail_lines<I>(lines: I, max_lines: usize) -> String
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    if max_lines == 0 {
        return String::new();
    }
    let mut tail = VecDeque::with_capacity(max_lines);
    for line in lines {
        if tail.len() == max_lines {
            tail.pop_front();
        }
        tail.push_back(line.into());
    }
    Vec::from(tail).join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(&PathBuf::from("/srv/atlas/workspaces/abc/images/0001.jpg")),
            "0001.jpg"
        );
    }

    #[test]
    fn test_redact_path_root() {
        assert_eq!(redact_path(&PathBuf::from("/")), "<unknown>");
    }

    #[test]
    fn test_strip_root_replaces_prefix() {
        let root = PathBuf::from("/srv/atlas");
        let text = "Failed to write file '/srv/atlas/status/x.json': denied";
        assert_eq!(
            strip_root(text, &root),
            "Failed to write file '<storage>/status/x.json': denied"
        );
    }

    #[test]
    fn test_strip_root_leaves_unrelated_text() {
        let root = PathBuf::from("/srv/atlas");
        assert_eq!(strip_root("tool exited with 2", &root), "tool exited with 2");
    }

    #[test]
    fn test_tail_lines() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail_lines(text.lines(), 2), "c\nd");
        assert_eq!(tail_lines(text.lines(), 10), text);
        assert_eq!(tail_lines(text.lines(), 0), "");
        assert_eq!(tail_lines("".lines(), 3), "");
        assert_eq!(tail_lines((0..1000).map(|i| i.to_string()), 2), "998\n999");
    }
}
