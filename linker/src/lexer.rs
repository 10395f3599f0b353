// lexer.rs — Tokenizer for assembler line files (.minst, .cinst, .xinst, .mem)
//
// Every line in the toolchain's text formats is a comma-separated list of
// fields with an optional trailing `# comment`. Uses the `logos` crate for
// DFA-based lexing; this module turns the token stream of one line into its
// trimmed fields.
//
// Preconditions: input is a single line (no embedded newlines).
// Postconditions: returns the fields in order, empty fields preserved.
// Failure modes: two fields not separated by a comma produce `LineError`.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// Malformed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    pub span: Span,
    pub message: String,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column {}: {}", self.span.start + 1, self.message)
    }
}

/// Line tokens.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+")]
pub enum Token {
    #[token(",")]
    Comma,

    /// Everything after `#`, trimmed.
    #[regex(r"#[^\n]*", |lex| lex.slice()[1..].trim().to_string())]
    Comment(String),

    /// A field: any run of characters other than separators and blanks.
    #[regex(r"[^,# \t\r\n]+", |lex| lex.slice().to_string())]
    Field(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Comma => write!(f, ","),
            Token::Comment(c) => write!(f, "# {c}"),
            Token::Field(s) => write!(f, "{s}"),
        }
    }
}

/// One tokenized line: its fields and optional comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedLine {
    pub fields: Vec<String>,
    pub comment: Option<String>,
}

/// Tokenize one line.
///
/// Returns `Ok(None)` for blank and comment-only lines.
pub fn tokenize_line(line: &str) -> Result<Option<TokenizedLine>, LineError> {
    let mut fields = Vec::new();
    let mut current: Option<String> = None;
    let mut comment = None;
    let mut seen_field_or_comma = false;

    for (result, range) in Token::lexer(line).spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(Token::Comma) => {
                fields.push(current.take().unwrap_or_default());
                seen_field_or_comma = true;
            }
            Ok(Token::Field(text)) => {
                if let Some(prev) = &current {
                    return Err(LineError {
                        span,
                        message: format!("expected ',' between '{prev}' and '{text}'"),
                    });
                }
                current = Some(text);
                seen_field_or_comma = true;
            }
            Ok(Token::Comment(text)) => {
                if !text.is_empty() {
                    comment = Some(text);
                }
                // `#` runs to end of line
                break;
            }
            Err(()) => {
                return Err(LineError {
                    span,
                    message: format!("unexpected character: {:?}", &line[span.start..span.end]),
                });
            }
        }
    }

    if !seen_field_or_comma {
        return Ok(None);
    }
    fields.push(current.unwrap_or_default());
    Ok(Some(TokenizedLine { fields, comment }))
}

// ── Tests ──
