/*!
  Compile-time errors. Every failure reported by the parser, the DFA builder,
  or the opcode assembler carries an [`ErrorKind`], the byte offset into the
  regex at which the problem was detected, and (once attached at the
  `Pattern` boundary) the offending regex text. The matcher itself reports no
  errors at run time.
*/

use thiserror::Error;

use crate::Index32;

pub type Result<T> = std::result::Result<T, RegexError>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Error)]
pub enum ErrorKind {
  #[error("empty character class")]
  EmptyClass,             //< class `[...]` is empty, e.g. `[a&&[b]]`
  #[error("empty (sub)expression")]
  EmptyExpression,        //< regex (sub)expression should not be empty
  #[error("regex exceeds maximum length")]
  ExceedsLength,
  #[error("regex exceeds complexity limits")]
  ExceedsLimits,
  #[error("invalid anchor")]
  InvalidAnchor,
  #[error("invalid backreference")]
  InvalidBackreference,
  #[error("invalid character class name or code point")]
  InvalidClass,
  #[error("invalid character class range")]
  InvalidClassRange,      //< e.g. `[Z-A]`
  #[error("invalid collating element")]
  InvalidCollating,       //< `[[.name.]]`
  #[error("invalid escape")]
  InvalidEscape,
  #[error("invalid modifier")]
  InvalidModifier,        //< invalid `(?imsux:)` modifier or option letter
  #[error("invalid lazy or possessive quantifier")]
  InvalidQuantifier,
  #[error("invalid repeat range")]
  InvalidRepeat,          //< e.g. `{10,1}`
  #[error("invalid syntax")]
  InvalidSyntax,
  #[error("mismatched {{ }}")]
  MismatchedBraces,
  #[error("mismatched [ ]")]
  MismatchedBrackets,
  #[error("mismatched ( )")]
  MismatchedParens,
  #[error("mismatched quotation")]
  MismatchedQuotation,    //< mismatched `\Q...\E` or `"..."`
  #[error("undefined macro name")]
  UndefinedName,
  #[error("cannot save or load predictor tables")]
  CannotSaveTables,
}

/// A compile-time failure: the error kind, the byte offset into the regex at
/// which it was detected, and the regex text itself.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("error: {kind} at position {offset}")]
pub struct RegexError {
  pub kind  : ErrorKind,
  pub offset: Index32,
  pub regex : String,
}

impl RegexError {

  pub fn new(kind: ErrorKind, offset: Index32) -> RegexError {
    RegexError { kind, offset, regex: String::new() }
  }

  /// Attaches the offending regex text; called once at the `Pattern`
  /// boundary so inner pipeline stages need not carry the string around.
  pub fn with_regex(mut self, regex: &str) -> RegexError {
    self.regex = regex.to_string();
    self
  }

  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  /// The character position at which the error occurred.
  pub fn idx(&self) -> Index32 {
    self.offset
  }

  /// A display form that marks the error offset within the regex text.
  pub fn display_with_carat(&self) -> String {
    let mut out = format!("error: {}\n  {}\n  ", self.kind, self.regex);
    for _ in 0..(self.offset as usize).min(self.regex.len()) {
      out.push(' ');
    }
    out.push('^');
    out
  }
}


#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn carries_offset_and_kind() {
    let e = RegexError::new(ErrorKind::MismatchedParens, 7).with_regex("(a|b))c");
    assert_eq!(e.kind(), ErrorKind::MismatchedParens);
    assert_eq!(e.idx(), 7);
    assert_eq!(e.regex, "(a|b))c");
  }

  #[test]
  fn carat_display() {
    let e = RegexError::new(ErrorKind::InvalidRepeat, 4).with_regex("ab{9,1}");
    let shown = e.display_with_carat();
    assert!(shown.contains("invalid repeat range"));
    assert!(shown.ends_with("    ^"));
  }
}
