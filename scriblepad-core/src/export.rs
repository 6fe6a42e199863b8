//! Download helpers: render title and body as a text or Markdown file.

use crate::document::{SharedDocument, TextField};

const UNTITLED: &str = "Untitled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    PlainText,
    Markdown,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::PlainText => "txt",
            ExportFormat::Markdown => "md",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ExportFormat::PlainText => "text/plain",
            ExportFormat::Markdown => "text/markdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFile {
    pub filename: String,
    pub mime_type: &'static str,
    pub contents: String,
}

/// Render `title` and `body` in the given format.
///
/// Plain text underlines the title with one `=` per character; Markdown
/// makes it a level-one heading. An empty title becomes `Untitled`.
pub fn render(title: &str, body: &str, format: ExportFormat) -> String {
    let title = display_title(title);
    match format {
        ExportFormat::PlainText => {
            let rule = "=".repeat(title.chars().count());
            format!("{title}\n{rule}\n\n{body}")
        }
        ExportFormat::Markdown => format!("# {title}\n\n{body}"),
    }
}

/// `My Notes!` becomes `my_notes_.md`.
pub fn file_name(title: &str, format: ExportFormat) -> String {
    let stem: String = display_title(title)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("{stem}.{}", format.extension())
}

/// Export the document's current title and body.
pub fn export(document: &SharedDocument, format: ExportFormat) -> ExportedFile {
    let title = document.text(TextField::Title);
    let body = document.text(TextField::Body);
    ExportedFile {
        filename: file_name(&title, format),
        mime_type: format.mime_type(),
        contents: render(&title, &body, format),
    }
}

fn display_title(title: &str) -> &str {
    if title.is_empty() {
        UNTITLED
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffStrategy;

    #[test]
    fn test_plain_text_layout() {
        assert_eq!(
            render("Notes", "line one\nline two", ExportFormat::PlainText),
            "Notes\n=====\n\nline one\nline two"
        );
    }

    #[test]
    fn test_markdown_layout() {
        assert_eq!(render("Notes", "body", ExportFormat::Markdown), "# Notes\n\nbody");
    }

    #[test]
    fn test_empty_title_is_untitled() {
        assert_eq!(render("", "x", ExportFormat::Markdown), "# Untitled\n\nx");
        assert_eq!(file_name("", ExportFormat::PlainText), "untitled.txt");
    }

    #[test]
    fn test_underline_counts_characters() {
        let out = render("Café", "", ExportFormat::PlainText);
        assert_eq!(out, "Café\n====\n\n");
    }

    #[test]
    fn test_file_name_sanitising() {
        assert_eq!(file_name("My Notes!", ExportFormat::Markdown), "my_notes_.md");
        assert_eq!(file_name("Q3-plan v2", ExportFormat::PlainText), "q3_plan_v2.txt");
        assert_eq!(file_name("Über", ExportFormat::PlainText), "_ber.txt");
    }

    #[test]
    fn test_export_reads_document() {
        let doc = SharedDocument::new();
        let origin = doc.new_origin();
        doc.replace_texts("Trip", "pack bags", DiffStrategy::Minimal, origin).unwrap();

        let file = export(&doc, ExportFormat::Markdown);
        assert_eq!(file.filename, "trip.md");
        assert_eq!(file.mime_type, "text/markdown");
        assert_eq!(file.contents, "# Trip\n\npack bags");
    }
}
