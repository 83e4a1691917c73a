//! Pre-transmission checks for command text.
//!
//! A command the engine cannot parse to completion leaves it waiting for more
//! input, which would stall the queue forever. Such commands are rejected here
//! and never sent.

use serde::Serialize;
use thiserror::Error;

use crate::config::ValidationConfig;
use crate::tokenizer::{mask_comments, tokenize, Token, TokenKind};

/// Why a command was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationFailure {
    #[error("backslash at end of input")]
    TrailingBackslash,
    #[error("'{found}' does not match '{opened}'")]
    MismatchedDelimiter { opened: char, found: char },
    #[error("'{found}' has no matching opening delimiter")]
    UnexpectedCloser { found: char },
    #[error("'{opened}' is never closed")]
    UnclosedDelimiter { opened: char },
    #[error("unterminated string")]
    UnterminatedString,
    #[error("unterminated comment")]
    UnterminatedComment,
    #[error("statement separator '{separator}' directly before '{closer}'")]
    SeparatorBeforeCloser { separator: char, closer: char },
    #[error("empty statement")]
    EmptyStatement,
    #[error("missing ';' or '$' at end of command")]
    MissingTerminator,
}

/// A rejected command: the failure and the character offset it was detected at
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{failure} (at character {offset})")]
pub struct ValidationError {
    pub offset: usize,
    pub failure: ValidationFailure,
}

impl ValidationError {
    fn at(offset: usize, failure: ValidationFailure) -> Self {
        Self { offset, failure }
    }
}

/// What a successful check learned about the command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Analysis {
    /// The command is a raw directive for the engine's underlying interpreter
    pub passthrough: bool,
    /// The last statement ends in `;` or `$`
    pub terminated: bool,
}

impl Analysis {
    /// Whether a terminator must be appended before transmission
    pub fn needs_terminator(&self) -> bool {
        !self.passthrough && !self.terminated
    }
}

fn closer_for(opener: char) -> char {
    match opener {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn is_separator(token: &Token) -> bool {
    token.kind == TokenKind::Operator && (token.is(';') || token.is('$'))
}

fn closing_char(token: &Token) -> Option<char> {
    if token.kind != TokenKind::Other {
        return None;
    }
    [')', ']', '}'].into_iter().find(|&c| token.is(c))
}

fn opening_char(token: &Token) -> Option<char> {
    if token.kind != TokenKind::Other {
        return None;
    }
    ['(', '[', '{'].into_iter().find(|&c| token.is(c))
}

/// Stateless command checker
#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidationConfig,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Is `text` a raw interpreter directive?
    pub fn is_passthrough(&self, text: &str) -> bool {
        let trimmed = text.trim_start();
        self.config
            .passthrough_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && trimmed.starts_with(prefix.as_str()))
    }

    /// Check `text`; `Ok(())` means it is safe to transmit
    pub fn validate(&self, text: &str) -> Result<(), ValidationError> {
        self.analyze(text).map(|_| ())
    }

    pub fn analyze(&self, text: &str) -> Result<Analysis, ValidationError> {
        let passthrough = self.is_passthrough(text);
        // Interpreter directives have no `/* */` comments
        let (code, open_comment) = if passthrough {
            (text.to_string(), None)
        } else {
            mask_comments(text)
        };
        let tokens = tokenize(&code);
        let end = text.chars().count();

        let mut stack: Vec<(char, usize)> = Vec::new();
        // Last significant token outside comments
        let mut last: Option<&Token> = None;

        for (idx, token) in tokens.iter().enumerate() {
            match token.kind {
                TokenKind::Space | TokenKind::Newline => continue,
                TokenKind::DanglingEscape => {
                    return Err(ValidationError::at(
                        token.offset,
                        ValidationFailure::TrailingBackslash,
                    ));
                }
                TokenKind::UnterminatedString => {
                    return Err(ValidationError::at(
                        token.offset,
                        ValidationFailure::UnterminatedString,
                    ));
                }
                _ => {}
            }

            if let Some(opened) = opening_char(token) {
                if !passthrough || opened == '(' {
                    stack.push((opened, token.offset));
                }
            } else if let Some(found) = closing_char(token) {
                if !passthrough || found == ')' {
                    match stack.pop() {
                        Some((opened, _)) if closer_for(opened) == found => {}
                        Some((opened, _)) => {
                            return Err(ValidationError::at(
                                token.offset,
                                ValidationFailure::MismatchedDelimiter { opened, found },
                            ));
                        }
                        None => {
                            return Err(ValidationError::at(
                                token.offset,
                                ValidationFailure::UnexpectedCloser { found },
                            ));
                        }
                    }
                }
            } else if !passthrough && is_separator(token) {
                self.check_separator(&tokens[idx..], last)?;
            }

            last = Some(token);
        }

        if let Some(offset) = open_comment {
            return Err(ValidationError::at(
                offset,
                ValidationFailure::UnterminatedComment,
            ));
        }
        if let Some(&(opened, offset)) = stack.last() {
            return Err(ValidationError::at(
                offset,
                ValidationFailure::UnclosedDelimiter { opened },
            ));
        }

        let terminated = last.is_some_and(is_separator);
        if self.config.require_terminator && !passthrough && !terminated && last.is_some() {
            return Err(ValidationError::at(end, ValidationFailure::MissingTerminator));
        }

        Ok(Analysis {
            passthrough,
            terminated,
        })
    }

    /// `rest[0]` is a separator; `previous` is the significant token before it
    fn check_separator(
        &self,
        rest: &[Token],
        previous: Option<&Token>,
    ) -> Result<(), ValidationError> {
        let separator = &rest[0];
        let separator_char = separator.text.chars().next().unwrap_or(';');

        if self.config.reject_empty_statements && previous.map_or(true, is_separator) {
            return Err(ValidationError::at(
                separator.offset,
                ValidationFailure::EmptyStatement,
            ));
        }

        let following = rest[1..]
            .iter()
            .find(|t| !matches!(t.kind, TokenKind::Space | TokenKind::Newline));
        if let Some(closer) = following.and_then(closing_char) {
            return Err(ValidationError::at(
                separator.offset,
                ValidationFailure::SeparatorBeforeCloser {
                    separator: separator_char,
                    closer,
                },
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(text: &str) -> ValidationFailure {
        Validator::default().validate(text).unwrap_err().failure
    }

    #[test]
    fn test_balanced_commands_are_valid() {
        let validator = Validator::default();
        assert!(validator.validate("(1+2)").is_ok());
        assert!(validator.validate("f(x):=x+1$").is_ok());
        assert!(validator.validate("1;;2").is_ok());
        assert!(validator.validate("[a, {b}, (c)];").is_ok());
        assert!(validator.validate("\"(\";").is_ok());
        assert!(validator.validate("/* ( */ 1;").is_ok());
        assert!(validator.validate("").is_ok());
    }

    #[test]
    fn test_unclosed_delimiter_reports_opener() {
        let err = Validator::default().validate("(1+2").unwrap_err();
        assert_eq!(err.offset, 0);
        assert_eq!(
            err.failure,
            ValidationFailure::UnclosedDelimiter { opened: '(' }
        );
    }

    #[test]
    fn test_mismatched_and_unexpected_closers() {
        let err = Validator::default().validate("f([x)];").unwrap_err();
        assert_eq!(err.offset, 4);
        assert_eq!(
            err.failure,
            ValidationFailure::MismatchedDelimiter {
                opened: '[',
                found: ')'
            }
        );
        assert_eq!(
            failure("x);"),
            ValidationFailure::UnexpectedCloser { found: ')' }
        );
    }

    #[test]
    fn test_unterminated_string_and_comment() {
        assert_eq!(failure("\"abc"), ValidationFailure::UnterminatedString);
        let err = Validator::default().validate("1; /* open /* nested */").unwrap_err();
        assert_eq!(err.failure, ValidationFailure::UnterminatedComment);
        assert_eq!(err.offset, 3);
    }

    #[test]
    fn test_quotes_inside_comments_are_ignored() {
        let validator = Validator::default();
        assert!(validator.validate("/* it\"s fine */ 1+1;").is_ok());
        assert!(validator.validate("1+1; /* say \"hi */").is_ok());
        assert!(!validator.analyze("1+1 /* \" */").unwrap().terminated);

        let err = validator.validate("/* \" */ (1;").unwrap_err();
        assert_eq!(err.offset, 8);
        assert_eq!(
            err.failure,
            ValidationFailure::UnclosedDelimiter { opened: '(' }
        );
        assert_eq!(
            failure("\"/* not a comment\" x)"),
            ValidationFailure::UnexpectedCloser { found: ')' }
        );
    }

    #[test]
    fn test_trailing_backslash() {
        assert_eq!(failure("abc\\"), ValidationFailure::TrailingBackslash);
    }

    #[test]
    fn test_separator_before_closer() {
        let err = Validator::default().validate("f(x; )").unwrap_err();
        assert_eq!(err.offset, 3);
        assert_eq!(
            err.failure,
            ValidationFailure::SeparatorBeforeCloser {
                separator: ';',
                closer: ')'
            }
        );
    }

    #[test]
    fn test_optional_rules() {
        let strict = Validator::new(ValidationConfig {
            require_terminator: true,
            reject_empty_statements: true,
            ..ValidationConfig::default()
        });
        assert_eq!(
            strict.validate("1;;2;").unwrap_err().failure,
            ValidationFailure::EmptyStatement
        );
        let err = strict.validate("1+1").unwrap_err();
        assert_eq!(err.failure, ValidationFailure::MissingTerminator);
        assert_eq!(err.offset, 3);
        assert!(strict.validate("1+1 /* done */ $").is_ok());
        assert!(strict.validate(":lisp (+ 1 2)").is_ok());
    }

    #[test]
    fn test_passthrough_relaxes_rules() {
        let validator = Validator::default();
        let analysis = validator.analyze(":lisp (print \"]\")").unwrap();
        assert!(analysis.passthrough);
        assert!(!analysis.needs_terminator());
        assert!(validator.validate(":lisp (car '(1 2]").is_err());
        assert!(validator.validate(":lisp-quiet (setq a [)").is_ok());
    }

    #[test]
    fn test_terminator_analysis() {
        let validator = Validator::default();
        assert!(validator.analyze("1+1").unwrap().needs_terminator());
        assert!(!validator.analyze("1+1$ /* c */").unwrap().needs_terminator());
    }
}
