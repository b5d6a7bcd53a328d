//! File summary condensation.
//!
//! A summary chunk opens with a header naming the file and its language.
//! Small files follow verbatim. Larger files keep their head (cut on a line
//! boundary) and a `Declarations:` section listing the signature line of
//! every structural block, so top-level structure survives truncation while
//! arbitrary middle content is dropped. The result never exceeds the budget.

use crate::models::Language;

use super::snap_to_char_boundary;

const DECLARATIONS_HEADING: &str = "\n...\n\nDeclarations:\n";

/// Build the summary text for a file within `max_chars` bytes.
pub fn summarize(
    path: &str,
    language: Language,
    text: &str,
    signatures: &[String],
    max_chars: usize,
) -> String {
    let header = format!("File: {}\nLanguage: {}\n\n", path, language.as_str());
    if header.len() >= max_chars {
        let cut = snap_to_char_boundary(&header, max_chars);
        return header[..cut].to_string();
    }
    let budget = max_chars - header.len();
    let body = text.trim_end();

    if body.len() <= budget {
        return format!("{}{}", header, body);
    }

    // Signatures may use at most half the budget; the head gets the rest.
    let mut declarations = String::new();
    if !signatures.is_empty() {
        let decl_budget = budget / 2;
        let mut section = String::from(DECLARATIONS_HEADING);
        let mut listed = 0;
        for sig in signatures {
            let entry = format!("- {}\n", sig);
            if section.len() + entry.len() > decl_budget {
                break;
            }
            section.push_str(&entry);
            listed += 1;
        }
        if listed > 0 {
            declarations = section;
        }
    }

    let mut out = String::with_capacity(max_chars);
    out.push_str(&header);
    if declarations.is_empty() {
        let elision = "\n...";
        out.push_str(line_snapped_head(body, budget.saturating_sub(elision.len())));
        out.push_str(elision);
    } else {
        out.push_str(line_snapped_head(body, budget - declarations.len()));
        out.push_str(declarations.trim_end());
    }
    out
}

/// The longest prefix of `text` within `max` bytes that ends on a line
/// boundary, or on a char boundary when the first line alone is too long.
fn line_snapped_head(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let cut = snap_to_char_boundary(text, max);
    match text[..cut].rfind('\n') {
        Some(pos) if pos > 0 => &text[..pos],
        _ => &text[..cut],
    }
}
