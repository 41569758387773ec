//! Splitting file content into embeddable chunks.

use std::path::Path;

/// Default maximum chunk size in characters.
pub const DEFAULT_CHUNK_CHARS: usize = 1200;

/// File extensions that are embedded into the index.
pub const INDEXED_EXTENSIONS: &[&str] = &["html", "htm", "css", "js"];

/// Split `content` into chunks of at most `max_chars` characters.
///
/// Chunks break on line boundaries where possible. A single line longer
/// than `max_chars` is cut on character boundaries. Whitespace-only input
/// yields no chunks.
pub fn chunk_text(content: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if content.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in content.split_inclusive('\n') {
        let line_len = line.chars().count();

        if line_len > max_chars {
            flush(&mut chunks, &mut current, &mut current_len);
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                let piece: String = piece.iter().collect();
                if !piece.trim().is_empty() {
                    chunks.push(piece);
                }
            }
            continue;
        }

        if current_len + line_len > max_chars {
            flush(&mut chunks, &mut current, &mut current_len);
        }
        current.push_str(line);
        current_len += line_len;
    }
    flush(&mut chunks, &mut current, &mut current_len);

    chunks
}

fn flush(chunks: &mut Vec<String>, current: &mut String, current_len: &mut usize) {
    if !current.trim().is_empty() {
        chunks.push(std::mem::take(current));
    } else {
        current.clear();
    }
    *current_len = 0;
}

/// Whether a file should be embedded, judged by its name.
///
/// Hidden files and editor/atomic-write temporaries are skipped.
pub fn is_indexable(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.ends_with('~') || name.ends_with(".swp") || name.ends_with(".tmp") {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            INDEXED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Render a relative path with forward slashes regardless of platform.
pub fn normalize_rel_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_yields_nothing() {
        assert!(chunk_text("", 100).is_empty());
        assert!(chunk_text("  \n\t\n", 100).is_empty());
    }

    #[test]
    fn test_small_content_single_chunk() {
        let chunks = chunk_text("body {\n  color: red;\n}\n", 100);
        assert_eq!(chunks, vec!["body {\n  color: red;\n}\n".to_string()]);
    }

    #[test]
    fn test_breaks_on_lines() {
        let content = "aaaa\nbbbb\ncccc\n";
        let chunks = chunk_text(content, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n".to_string(), "cccc\n".to_string()]);
    }

    #[test]
    fn test_long_line_is_split() {
        let content = "x".repeat(25);
        let chunks = chunk_text(&content, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], "xxxxx");
    }

    #[test]
    fn test_is_indexable() {
        assert!(is_indexable(Path::new("site/index.html")));
        assert!(is_indexable(Path::new("styles.CSS")));
        assert!(is_indexable(Path::new("app.js")));
        assert!(!is_indexable(Path::new("logo.png")));
        assert!(!is_indexable(Path::new(".tmpA1b2.html")));
        assert!(!is_indexable(Path::new("styles.css~")));
        assert!(!is_indexable(Path::new("notes")));
    }

    #[test]
    fn test_normalize_rel_path() {
        let path = Path::new("assets").join("js").join("app.js");
        assert_eq!(normalize_rel_path(&path), "assets/js/app.js");
    }
}
