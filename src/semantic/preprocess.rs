//! Text preparation for file embeddings.
//!
//! Each file is embedded from its name followed by its path:
//! 1. Trim and collapse whitespace runs
//! 2. Concatenate name and path with a single space
//! 3. Truncate to max length with ellipsis

/// Maximum content length for embedding input (characters, not tokens)
const MAX_CONTENT_LENGTH: usize = 512;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Build the embedding text for a file.
pub fn file_text(name: &str, path: &str) -> String {
    let name = collapse_whitespace(name);
    let path = collapse_whitespace(path);

    let content = match (name.is_empty(), path.is_empty()) {
        (true, _) => path,
        (false, true) => name,
        (false, false) => format!("{} {}", name, path),
    };

    truncate_content(&content)
}

/// Whether a query carries any text worth embedding.
pub fn is_blank(query: &str) -> bool {
    query.trim().is_empty()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate content to MAX_CONTENT_LENGTH characters, adding ellipsis if truncated.
fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_CONTENT_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_CONTENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_and_path() {
        assert_eq!(
            file_text("report.pdf", "/home/me/docs/report.pdf"),
            "report.pdf /home/me/docs/report.pdf"
        );
    }

    #[test]
    fn test_missing_parts() {
        assert_eq!(file_text("", "/a/b.txt"), "/a/b.txt");
        assert_eq!(file_text("b.txt", "  "), "b.txt");
        assert_eq!(file_text("", ""), "");
    }

    #[test]
    fn test_whitespace_collapsed() {
        assert_eq!(file_text("  my   notes.md ", "/x/my notes.md"), "my notes.md /x/my notes.md");
    }

    #[test]
    fn test_truncation_is_char_safe() {
        let name = "日".repeat(1000);
        let content = file_text(&name, "/p");
        assert_eq!(content.chars().count(), MAX_CONTENT_LENGTH);
        assert!(content.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn test_blank_queries() {
        assert!(is_blank(""));
        assert!(is_blank("   \t\n"));
        assert!(!is_blank(" tax "));
    }
}
