//! Lexer for engine command text.
//!
//! Used for client-side analysis only (definition extraction and delimiter
//! checking); the engine never sees tokens. Classification of a token never
//! depends on its neighbours: the lexer is a single forward pass.

use serde::Serialize;

/// Characters that always form a one-character operator token
pub const OPERATORS: &str = "+-*/^:=#'!;$";

/// Unicode minus sign, lexed like `-`
const UNICODE_MINUS: char = '\u{2212}';

/// Middle dot, accepted in place of `*` inside comment markers
const MIDDLE_DOT: char = '\u{B7}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// `\n` or `\r`
    Newline,
    /// `+`, `-` or the unicode minus; operator or sign depending on context
    Sign,
    /// `/*`
    CommentStart,
    /// `*/`
    CommentEnd,
    /// A single character from [`OPERATORS`]
    Operator,
    Identifier,
    /// A quoted string including both quotes
    String,
    /// A quoted string that runs to the end of the input
    UnterminatedString,
    /// Digits, optionally followed by letters
    Number,
    /// A run of plain spaces
    Space,
    /// A backslash that is the very last character of the input
    DanglingEscape,
    /// Any other single character (brackets, commas, tabs, ...)
    Other,
}

/// One lexical token with its character offset in the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Offset of the first character, counted in `char`s
    pub offset: usize,
}

impl Token {
    fn new(kind: TokenKind, text: String, offset: usize) -> Self {
        Self { kind, text, offset }
    }

    /// Is this the one-character token `ch`?
    pub fn is(&self, ch: char) -> bool {
        let mut chars = self.text.chars();
        chars.next() == Some(ch) && chars.next().is_none()
    }
}

pub fn is_alpha(ch: char) -> bool {
    ch.is_alphabetic() || matches!(ch, '\\' | '_' | '%')
}

pub fn is_num(ch: char) -> bool {
    ch.is_ascii_digit()
}

pub fn is_alnum(ch: char) -> bool {
    is_alpha(ch) || is_num(ch)
}

/// Split `source` into tokens
pub fn tokenize(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        let start = i;

        if ch == '\n' || ch == '\r' {
            tokens.push(Token::new(TokenKind::Newline, ch.to_string(), start));
            i += 1;
        } else if ch == '+' || ch == '-' || ch == UNICODE_MINUS {
            tokens.push(Token::new(TokenKind::Sign, ch.to_string(), start));
            i += 1;
        } else if ch == '/' && matches!(next, Some('*') | Some(MIDDLE_DOT)) {
            let text: String = chars[i..i + 2].iter().collect();
            tokens.push(Token::new(TokenKind::CommentStart, text, start));
            i += 2;
        } else if (ch == '*' || ch == MIDDLE_DOT) && next == Some('/') {
            let text: String = chars[i..i + 2].iter().collect();
            tokens.push(Token::new(TokenKind::CommentEnd, text, start));
            i += 2;
        } else if OPERATORS.contains(ch) {
            tokens.push(Token::new(TokenKind::Operator, ch.to_string(), start));
            i += 1;
        } else if is_alpha(ch) || ch == '?' {
            i = lex_identifier(&chars, i, &mut tokens);
        } else if ch == '"' {
            i = lex_string(&chars, i, &mut tokens);
        } else if is_num(ch) {
            while i < chars.len() && (is_num(chars[i]) || chars[i].is_ascii_alphabetic()) {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::new(TokenKind::Number, text, start));
        } else if ch == ' ' {
            while i < chars.len() && chars[i] == ' ' {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::new(TokenKind::Space, text, start));
        } else {
            tokens.push(Token::new(TokenKind::Other, ch.to_string(), start));
            i += 1;
        }
    }

    tokens
}

fn lex_identifier(chars: &[char], mut i: usize, tokens: &mut Vec<Token>) -> usize {
    let start = i;
    let mut text = String::new();
    if chars[i] == '?' {
        text.push('?');
        i += 1;
    }

    while i < chars.len() && is_alnum(chars[i]) {
        let ch = chars[i];
        if ch != '\\' {
            text.push(ch);
            i += 1;
            continue;
        }
        match chars.get(i + 1) {
            None => {
                if !text.is_empty() {
                    tokens.push(Token::new(TokenKind::Identifier, text, start));
                }
                tokens.push(Token::new(TokenKind::DanglingEscape, "\\".to_string(), i));
                return i + 1;
            }
            // A line continuation ends the identifier; the newline is lexed next.
            Some('\n') => {
                text.push('\\');
                i += 1;
                break;
            }
            Some(&escaped) => {
                text.push('\\');
                text.push(escaped);
                i += 2;
            }
        }
    }

    tokens.push(Token::new(TokenKind::Identifier, text, start));
    i
}

fn lex_string(chars: &[char], mut i: usize, tokens: &mut Vec<Token>) -> usize {
    let start = i;
    let mut text = String::from('"');
    i += 1;

    while i < chars.len() {
        let ch = chars[i];
        text.push(ch);
        i += 1;
        if ch == '\\' {
            if let Some(&escaped) = chars.get(i) {
                text.push(escaped);
                i += 1;
            }
        } else if ch == '"' {
            tokens.push(Token::new(TokenKind::String, text, start));
            return i;
        }
    }

    tokens.push(Token::new(TokenKind::UnterminatedString, text, start));
    i
}

/// Copy of `source` with every `/* ... */` comment, markers included,
/// blanked out with spaces. Line breaks survive so offsets still line up.
///
/// Inside a comment only the comment markers count: a quote there does not
/// open a string. Comments nest. Also returns the offset of the outermost
/// comment that is never closed.
pub fn mask_comments(source: &str) -> (String, Option<usize>) {
    let chars: Vec<char> = source.chars().collect();
    let mut masked = String::with_capacity(source.len());
    let mut open: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        let starts_comment = ch == '/' && matches!(next, Some('*') | Some(MIDDLE_DOT));

        if !open.is_empty() {
            if starts_comment {
                open.push(i);
                masked.push_str("  ");
                i += 2;
            } else if (ch == '*' || ch == MIDDLE_DOT) && next == Some('/') {
                open.pop();
                masked.push_str("  ");
                i += 2;
            } else {
                masked.push(if ch == '\n' || ch == '\r' { ch } else { ' ' });
                i += 1;
            }
            continue;
        }

        if starts_comment && !in_string {
            open.push(i);
            masked.push_str("  ");
            i += 2;
            continue;
        }

        masked.push(ch);
        i += 1;
        match ch {
            // An escaped character is never a quote or a comment marker
            '\\' => {
                if let Some(escaped) = next {
                    masked.push(escaped);
                    i += 1;
                }
            }
            '"' => in_string = !in_string,
            _ => {}
        }
    }

    (masked, open.first().copied())
}

/// Names defined in `source` by `name(args) :=`, `name :=` or `name :` forms,
/// in order of first appearance. Text inside comments is ignored.
pub fn definitions(source: &str) -> Vec<String> {
    let (code, _) = mask_comments(source);
    let code: Vec<Token> = tokenize(&code)
        .into_iter()
        .filter(|t| !matches!(t.kind, TokenKind::Space | TokenKind::Newline))
        .collect();

    let mut names: Vec<String> = Vec::new();
    for (idx, token) in code.iter().enumerate() {
        if token.kind != TokenKind::Identifier || token.text.starts_with('?') {
            continue;
        }
        let mut after = idx + 1;
        if code.get(after).is_some_and(|t| t.is('(')) {
            let mut depth = 0usize;
            while let Some(t) = code.get(after) {
                if t.is('(') {
                    depth += 1;
                } else if t.is(')') {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                after += 1;
            }
            after += 1;
            let is_function_def = code.get(after).is_some_and(|t| t.is(':'))
                && code.get(after + 1).is_some_and(|t| t.is('='));
            if !is_function_def {
                continue;
            }
        } else if !code.get(after).is_some_and(|t| t.is(':')) {
            continue;
        }
        if !names.contains(&token.text) {
            names.push(token.text.clone());
        }
    }
    names
}
