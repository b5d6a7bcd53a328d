//! Fixed-size, line-snapped overlapping windows.
//!
//! Used for files without a structural parser, for files where the parser
//! found nothing, and for structural blocks that exceed the block ceiling.

/// A contiguous slice of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub text: String,
}

/// Split `text` into windows of at most `window_chars` bytes.
///
/// Windows end on line boundaries. Consecutive windows share up to
/// `overlap_chars` bytes of trailing lines. A single line longer than the
/// window is hard-split on UTF-8 boundaries and every piece carries that
/// line's number. Blank windows are skipped, so empty text yields nothing.
pub fn window_text(text: &str, window_chars: usize, overlap_chars: usize) -> Vec<Window> {
    let window_chars = window_chars.max(1);
    let lines: Vec<&str> = text.lines().collect();
    let mut windows = Vec::new();
    let mut start = 0;

    while start < lines.len() {
        if lines[start].len() > window_chars {
            for piece in split_long_line(lines[start], window_chars) {
                if !piece.trim().is_empty() {
                    windows.push(Window {
                        start_line: start + 1,
                        end_line: start + 1,
                        text: piece.to_string(),
                    });
                }
            }
            start += 1;
            continue;
        }

        let mut end = start;
        let mut size = 0;
        while end < lines.len() {
            let add = lines[end].len() + usize::from(end > start);
            if size + add > window_chars {
                break;
            }
            size += add;
            end += 1;
        }

        let body = lines[start..end].join("\n");
        if !body.trim().is_empty() {
            windows.push(Window {
                start_line: start + 1,
                end_line: end,
                text: body,
            });
        }
        if end >= lines.len() {
            break;
        }

        // Step back over trailing lines that fit in the overlap, always
        // advancing by at least one line.
        let mut next = end;
        let mut tail = 0;
        while next > start + 1 {
            let add = lines[next - 1].len() + 1;
            if tail + add > overlap_chars {
                break;
            }
            tail += add;
            next -= 1;
        }
        start = next;
    }

    windows
}

fn split_long_line(line: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = line;
    while !rest.is_empty() {
        let mut cut = super::snap_to_char_boundary(rest, max);
        if cut == 0 {
            cut = rest
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
        }
        pieces.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    pieces
}
