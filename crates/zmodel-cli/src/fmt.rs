//! `.zmodel` formatter.
//!
//! Formatting is a parse/print round trip: the document is parsed into the
//! typed AST and regenerated by the canonical printer. The AST does not keep
//! comments, so a document that contains them is refused unless the caller
//! explicitly asks for them to be dropped.

use anyhow::{anyhow, Result};
use colored::Colorize;
use std::path::Path;

/// Byte offsets of `//` and `/*` comment openers outside string literals.
pub fn comment_offsets(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                } else if b == b'/' && matches!(bytes.get(i + 1), Some(b'/') | Some(b'*')) {
                    found.push(i);
                    let close = if bytes[i + 1] == b'/' { "\n" } else { "*/" };
                    match text[i + 2..].find(close) {
                        Some(end) => i += 2 + end + close.len() - 1,
                        None => break,
                    }
                }
            }
        }
        i += 1;
    }
    found
}

pub fn format_zmodel(text: &str, strip_comments: bool) -> Result<String> {
    if !strip_comments {
        if let Some(&first) = comment_offsets(text).first() {
            let (line, column) = zmodel_dsl::ast::line_col(text, first);
            return Err(anyhow!(
                "document has comments (first at line {line}, column {column}); \
                 formatting would drop them (pass --strip-comments to proceed)"
            ));
        }
    }
    let document = zmodel_dsl::parse_document(text)?;
    Ok(zmodel_dsl::print_document(&document))
}

pub fn cmd_fmt_zmodel(
    input: &Path,
    out: Option<&Path>,
    write: bool,
    strip_comments: bool,
) -> Result<()> {
    if write && out.is_some() {
        return Err(anyhow!("cannot use --write and --out together"));
    }
    let text = std::fs::read_to_string(input)
        .map_err(|e| anyhow!("failed to read {}: {e}", input.display()))?;
    let rendered = format_zmodel(&text, strip_comments)
        .map_err(|e| anyhow!("{}: {e}", input.display()))?;
    if write {
        if rendered == text {
            tracing::info!(file = %input.display(), "already formatted");
        }
        std::fs::write(input, rendered)?;
        eprintln!("{} {}", "formatted".green().bold(), input.display());
        return Ok(());
    }
    if let Some(out) = out {
        std::fs::write(out, rendered)?;
        eprintln!("{} {}", "wrote".green().bold(), out.display().to_string().bold());
        return Ok(());
    }
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_markers_inside_strings_are_ignored() {
        let text = "datasource db {\n provider = 'sqlite'\n url = \"file://x.db\"\n}\n";
        assert!(comment_offsets(text).is_empty());
    }

    #[test]
    fn finds_line_and_block_comments() {
        let text = "// head\nmodel M { id Int @id /* inline */ }\n";
        assert_eq!(comment_offsets(text), vec![0, 29]);
    }

    #[test]
    fn refuses_comments_unless_stripping() {
        let text = "// note\nmodel M { id Int @id }\n";
        let err = format_zmodel(text, false).expect_err("comments");
        assert!(err.to_string().contains("--strip-comments"));
        let formatted = format_zmodel(text, true).expect("format");
        assert!(formatted.contains("model M {"));
        assert!(!formatted.contains("note"));
    }

    #[test]
    fn formatting_is_idempotent() {
        let text = "model   M {\n id Int @id\n   name String?   @unique\n}";
        let once = format_zmodel(text, false).expect("format");
        let twice = format_zmodel(&once, false).expect("format");
        assert_eq!(once, twice);
    }
}
