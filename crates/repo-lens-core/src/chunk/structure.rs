//! Structural parsers.
//!
//! A [`StructuralParser`] turns a file into top-level declaration blocks
//! (functions, types, impls, classes). Parsers are looked up per
//! [`Language`] through a [`ParserRegistry`]; a language without an entry
//! falls back to fixed windows.
//!
//! Two built-in families exist:
//!
//! - [`BraceParser`] for C-family syntax. Declaration starts are found by
//!   regex, and the block extends to the matching closing brace. Strings,
//!   character literals, line comments and block comments are skipped while
//!   counting braces.
//! - [`IndentParser`] for Python: top-level `def` / `class` with their
//!   decorators, ending at the next line back at column zero.

use regex::Regex;
use std::collections::HashMap;

use crate::models::Language;

/// One top-level declaration found by a parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralBlock {
    pub symbol: String,
    /// The declaration line itself, trimmed.
    pub signature: String,
    /// 1-based, inclusive. Includes leading doc comments and attributes.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub text: String,
}

/// Extracts declaration blocks from source text.
pub trait StructuralParser: Send + Sync {
    fn parse_structure(&self, text: &str) -> Vec<StructuralBlock>;
}

/// Capability lookup from language to parser.
pub struct ParserRegistry {
    parsers: HashMap<Language, Box<dyn StructuralParser>>,
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with every built-in parser.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Language::Rust, Box::new(BraceParser::rust()));
        registry.register(Language::Go, Box::new(BraceParser::go()));
        registry.register(Language::Java, Box::new(BraceParser::java()));
        registry.register(Language::CSharp, Box::new(BraceParser::csharp()));
        registry.register(Language::Kotlin, Box::new(BraceParser::kotlin()));
        registry.register(Language::JavaScript, Box::new(BraceParser::javascript()));
        registry.register(Language::TypeScript, Box::new(BraceParser::typescript()));
        registry.register(Language::Python, Box::new(IndentParser::python()));
        registry
    }

    pub fn register(&mut self, language: Language, parser: Box<dyn StructuralParser>) {
        self.parsers.insert(language, parser);
    }

    pub fn get(&self, language: Language) -> Option<&dyn StructuralParser> {
        self.parsers.get(&language).map(|p| p.as_ref())
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut languages: Vec<&str> = self.parsers.keys().map(|l| l.as_str()).collect();
        languages.sort_unstable();
        f.debug_struct("ParserRegistry")
            .field("languages", &languages)
            .finish()
    }
}

/// How a declaration pattern turns its captures into a symbol name.
#[derive(Debug, Clone, Copy)]
enum SymbolStyle {
    /// The `name` group verbatim.
    Name,
    /// `impl` followed by the captured header, for Rust impl blocks.
    ImplHeader,
}

#[derive(Debug)]
struct DeclPattern {
    re: Regex,
    style: SymbolStyle,
}

/// Lexical details that matter while matching braces.
#[derive(Debug, Clone, Copy)]
struct BraceSyntax {
    /// Characters that open a string closed by the same character.
    quotes: &'static [char],
    /// Quote characters whose strings may span lines.
    multiline_quotes: &'static [char],
    /// Treat `'` as a Rust char literal or lifetime rather than a quote.
    rust_char_literals: bool,
}

/// Parser for brace-delimited languages.
#[derive(Debug)]
pub struct BraceParser {
    patterns: Vec<DeclPattern>,
    syntax: BraceSyntax,
}

/// Maximum lines a declaration header may span before its opening brace.
const MAX_HEADER_LINES: usize = 20;

fn pattern(re: &str, style: SymbolStyle) -> DeclPattern {
    DeclPattern {
        re: Regex::new(re).expect("Invalid regex"),
        style,
    }
}

const JAVA_LIKE_MODIFIERS: &str = r"(?:(?:public|private|protected|internal|static|final|abstract|sealed|partial|open|data|inner|override|virtual|readonly|async|unsafe|new|enum|annotation|value)\s+)*";

impl BraceParser {
    pub fn rust() -> Self {
        Self {
            patterns: vec![
                pattern(
                    r#"^\s*(?:pub(?:\s*\([^)]*\))?\s+)?(?:default\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?(?:fn|struct|enum|trait|union|mod|type)\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)"#,
                    SymbolStyle::Name,
                ),
                pattern(
                    r"^\s*(?:unsafe\s+)?impl\b(?P<name>[^{]*)",
                    SymbolStyle::ImplHeader,
                ),
                pattern(
                    r"^\s*macro_rules!\s*(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                    SymbolStyle::Name,
                ),
            ],
            syntax: BraceSyntax {
                quotes: &['"'],
                multiline_quotes: &['"'],
                rust_char_literals: true,
            },
        }
    }

    pub fn go() -> Self {
        Self {
            patterns: vec![
                pattern(
                    r"^func\s+(?:\([^)]*\)\s*)?(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                    SymbolStyle::Name,
                ),
                pattern(
                    r"^type\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s+(?:struct|interface)\b",
                    SymbolStyle::Name,
                ),
            ],
            syntax: BraceSyntax {
                quotes: &['"', '\'', '`'],
                multiline_quotes: &['`'],
                rust_char_literals: false,
            },
        }
    }

    pub fn java() -> Self {
        Self::java_like(&[])
    }

    pub fn csharp() -> Self {
        Self::java_like(&[])
    }

    pub fn kotlin() -> Self {
        Self::java_like(&[pattern(
            r"^\s*(?:(?:public|private|internal|protected|inline|suspend|override|open|operator|infix|tailrec)\s+)*fun\s+(?:<[^>]*>\s*)?(?:[A-Za-z_][\w.]*\.)?(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
            SymbolStyle::Name,
        )])
    }

    fn java_like(extra: &[DeclPattern]) -> Self {
        let mut patterns = vec![pattern(
            &format!(
                r"^\s*(?:@\w+(?:\([^)]*\))?\s+)*{}(?:class|interface|enum|record|struct|object)\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                JAVA_LIKE_MODIFIERS
            ),
            SymbolStyle::Name,
        )];
        for p in extra {
            patterns.push(DeclPattern {
                re: p.re.clone(),
                style: p.style,
            });
        }
        Self {
            patterns,
            syntax: BraceSyntax {
                quotes: &['"', '\''],
                multiline_quotes: &[],
                rust_char_literals: false,
            },
        }
    }

    pub fn javascript() -> Self {
        Self {
            patterns: js_patterns(),
            syntax: BraceSyntax {
                quotes: &['"', '\'', '`'],
                multiline_quotes: &['`'],
                rust_char_literals: false,
            },
        }
    }

    pub fn typescript() -> Self {
        let mut patterns = js_patterns();
        patterns.push(pattern(
            r"^\s*(?:export\s+)?(?:declare\s+)?(?:const\s+)?(?:interface|enum|type|namespace)\s+(?P<name>[A-Za-z_$][\w$]*)",
            SymbolStyle::Name,
        ));
        Self {
            patterns,
            syntax: BraceSyntax {
                quotes: &['"', '\'', '`'],
                multiline_quotes: &['`'],
                rust_char_literals: false,
            },
        }
    }

    fn match_decl(&self, line: &str) -> Option<String> {
        for p in &self.patterns {
            if let Some(caps) = p.re.captures(line) {
                let raw = caps.name("name").map(|m| m.as_str()).unwrap_or("");
                let symbol = match p.style {
                    SymbolStyle::Name => raw.to_string(),
                    SymbolStyle::ImplHeader => {
                        let header = raw.split(" where ").next().unwrap_or(raw).trim_end();
                        format!("impl{}", header)
                    }
                };
                if !symbol.is_empty() {
                    return Some(symbol);
                }
            }
        }
        None
    }
}

fn js_patterns() -> Vec<DeclPattern> {
    vec![
        pattern(
            r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\*?\s+(?P<name>[A-Za-z_$][\w$]*)",
            SymbolStyle::Name,
        ),
        pattern(
            r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+(?P<name>[A-Za-z_$][\w$]*)",
            SymbolStyle::Name,
        ),
        pattern(
            r"^\s*(?:export\s+)?(?:const|let|var)\s+(?P<name>[A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*(?::[^=]+)?=>|[A-Za-z_$][\w$]*\s*=>)",
            SymbolStyle::Name,
        ),
    ]
}

/// Line prefixes that attach to the declaration below them.
fn is_leading_decoration(trimmed: &str) -> bool {
    trimmed.starts_with("///")
        || trimmed.starts_with("//!")
        || trimmed.starts_with("#[")
        || trimmed.starts_with("/**")
        || trimmed.starts_with("* ")
        || trimmed == "*"
        || trimmed.starts_with("*/")
        || trimmed.starts_with('@')
        || trimmed.starts_with("[")
}

/// Tokens after which a declaration header continues on the next line.
fn header_continues(current: &str, next: Option<&str>) -> bool {
    let current = current.trim_end();
    if [",", "(", "=>", "->", "=", "+", "|", "&", "<"]
        .iter()
        .any(|t| current.ends_with(t))
        || current.ends_with("where")
    {
        return true;
    }
    match next.map(str::trim_start) {
        Some(n) => {
            n.starts_with('{')
                || n.starts_with("where")
                || n.starts_with("->")
                || n.starts_with(':')
                || n.starts_with("throws")
                || n.starts_with("extends")
                || n.starts_with("implements")
        }
        None => false,
    }
}

struct BraceScanner {
    syntax: BraceSyntax,
    depth: i32,
    paren: i32,
    opened: bool,
    in_str: Option<char>,
    in_block_comment: bool,
}

/// Outcome of scanning one line.
enum LineEnd {
    /// Block closed on this line.
    Closed,
    /// Header terminated by `;` before any brace.
    Terminated,
    Continue,
}

impl BraceScanner {
    fn new(syntax: BraceSyntax) -> Self {
        Self {
            syntax,
            depth: 0,
            paren: 0,
            opened: false,
            in_str: None,
            in_block_comment: false,
        }
    }

    fn scan_line(&mut self, line: &str) -> LineEnd {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            if self.in_block_comment {
                if c == '*' && next == Some('/') {
                    self.in_block_comment = false;
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }
            if let Some(q) = self.in_str {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if c == q {
                    self.in_str = None;
                }
                i += 1;
                continue;
            }

            match c {
                '/' if next == Some('/') => break,
                '/' if next == Some('*') => {
                    self.in_block_comment = true;
                    i += 2;
                    continue;
                }
                '\'' if self.syntax.rust_char_literals => {
                    // 'x' or '\n'; otherwise a lifetime
                    if next == Some('\\') {
                        let close = chars[i + 2..].iter().position(|&ch| ch == '\'');
                        i += close.map(|p| p + 3).unwrap_or(chars.len() - i);
                        continue;
                    }
                    if chars.get(i + 2) == Some(&'\'') {
                        i += 3;
                        continue;
                    }
                }
                q if self.syntax.quotes.contains(&q) => {
                    self.in_str = Some(q);
                }
                '(' => self.paren += 1,
                ')' => self.paren -= 1,
                '{' => {
                    self.depth += 1;
                    self.opened = true;
                }
                '}' => {
                    self.depth -= 1;
                    if self.opened && self.depth <= 0 {
                        return LineEnd::Closed;
                    }
                }
                ';' if !self.opened && self.paren <= 0 => return LineEnd::Terminated,
                _ => {}
            }
            i += 1;
        }

        if let Some(q) = self.in_str {
            if !self.syntax.multiline_quotes.contains(&q) {
                self.in_str = None;
            }
        }
        LineEnd::Continue
    }
}

impl BraceParser {
    /// Index of the last line of the block whose header starts at `start`.
    fn block_end(&self, lines: &[&str], start: usize) -> usize {
        let mut scanner = BraceScanner::new(self.syntax);
        for idx in start..lines.len() {
            match scanner.scan_line(lines[idx]) {
                LineEnd::Closed | LineEnd::Terminated => return idx,
                LineEnd::Continue => {}
            }
            if !scanner.opened {
                if idx - start >= MAX_HEADER_LINES {
                    return start;
                }
                let next = lines.get(idx + 1).copied();
                if scanner.paren <= 0
                    && scanner.in_str.is_none()
                    && !header_continues(lines[idx], next)
                {
                    return idx;
                }
            }
        }
        lines.len().saturating_sub(1)
    }
}

impl StructuralParser for BraceParser {
    fn parse_structure(&self, text: &str) -> Vec<StructuralBlock> {
        let lines: Vec<&str> = text.lines().collect();
        let mut blocks = Vec::new();
        let mut consumed = 0;
        let mut idx = 0;

        while idx < lines.len() {
            let Some(symbol) = self.match_decl(lines[idx]) else {
                idx += 1;
                continue;
            };
            let end = self.block_end(&lines, idx);

            let mut start = idx;
            while start > consumed && is_leading_decoration(lines[start - 1].trim_start()) {
                start -= 1;
            }

            blocks.push(StructuralBlock {
                symbol,
                signature: lines[idx].trim().to_string(),
                start_line: start + 1,
                end_line: end + 1,
                text: lines[start..=end].join("\n"),
            });
            consumed = end + 1;
            idx = end + 1;
        }

        blocks
    }
}

/// Parser for indentation-delimited languages.
#[derive(Debug)]
pub struct IndentParser {
    decl: Regex,
}

impl IndentParser {
    pub fn python() -> Self {
        Self {
            decl: Regex::new(r"^(?:async\s+)?(?:def|class)\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)")
                .expect("Invalid regex"),
        }
    }
}

/// Number of triple-quote delimiters on a line.
fn triple_quotes(line: &str) -> usize {
    line.matches("\"\"\"").count() + line.matches("'''").count()
}

impl StructuralParser for IndentParser {
    fn parse_structure(&self, text: &str) -> Vec<StructuralBlock> {
        let lines: Vec<&str> = text.lines().collect();
        let mut blocks = Vec::new();
        let mut consumed = 0;
        let mut idx = 0;

        while idx < lines.len() {
            let Some(caps) = self.decl.captures(lines[idx]) else {
                idx += 1;
                continue;
            };
            let symbol = caps
                .name("name")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();

            let mut start = idx;
            while start > consumed && lines[start - 1].starts_with('@') {
                start -= 1;
            }

            let mut end = idx;
            let mut in_docstring = triple_quotes(lines[idx]) % 2 == 1;
            let mut cursor = idx + 1;
            while cursor < lines.len() {
                let line = lines[cursor];
                let at_column_zero = !line.is_empty()
                    && !line.starts_with(' ')
                    && !line.starts_with('\t');
                if at_column_zero && !in_docstring && !line.starts_with(')') {
                    break;
                }
                if triple_quotes(line) % 2 == 1 {
                    in_docstring = !in_docstring;
                }
                if !line.trim().is_empty() {
                    end = cursor;
                }
                cursor += 1;
            }

            blocks.push(StructuralBlock {
                symbol,
                signature: lines[idx].trim().to_string(),
                start_line: start + 1,
                end_line: end + 1,
                text: lines[start..=end].join("\n"),
            });
            consumed = end + 1;
            idx = end + 1;
        }

        blocks
    }
}
