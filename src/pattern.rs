/*!

  A `Pattern` is the immutable compiled artifact: the opcode table, the
  predictor tables, and the find-time strategy selected from the pattern's
  prefix properties. Patterns are built from a regex string (running the
  full parser -> DFA -> assembler pipeline) or from a precompiled opcode
  table plus predictor blob. Once constructed a `Pattern` never changes and
  may be shared by reference across threads; each thread matches with its
  own [`Matcher`](crate::matcher::Matcher).

*/

use std::time::Duration;

use memchr::memmem;
use tracing::debug;

use crate::compiler;
use crate::dfa::Dfa;
use crate::error::Result;
use crate::opcode::Opcode;
use crate::options::Options;
use crate::parser::Parser;
use crate::predict::Predictor;
use crate::{Accept32, Lookahead16};

/// The find-time "advance to next candidate" strategy, selected at compile
/// time from the prefix properties (see the `advance` module).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Strategy {
  /// No usable prefix information: try every position.
  Nothing,
  /// A single starting byte: memchr.
  Char(u8),
  /// A short anchored prefix of 2..=8 bytes: windowed compare.
  Chars,
  /// A long literal prefix: vectorized substring search.
  String,
  /// A long high-entropy prefix: Boyer-Moore with the skip table.
  StringBm,
  /// No literal prefix: bitap over 4-byte windows, min length attached.
  PatternMin(u8),
  /// Up to 16 distinct literal needles: multi-needle scan.
  PatternPin(u8),
}

/// Which predict-match assist the advance loop consults after a candidate.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PredictKind {
  None,
  /// The 4-byte `pma` window predictor.
  Pma,
  /// The up-to-8-byte `pmh` bloom predictor.
  Pmh,
}

pub struct Pattern {
  rex : String,
  opt : Options,
  opc : Vec<u32>,
  pred: Predictor,

  accept_count   : Accept32,
  lookahead_count: Lookahead16,

  strategy    : Strategy,
  predict_kind: PredictKind,
  finder      : Option<memmem::Finder<'static>>,

  parse_time   : Duration,
  assemble_time: Duration,
}

impl Pattern {

  /// Compiles `regex` under the option letters in `options`.
  pub fn new(regex: &str, options: &str) -> Result<Pattern> {
    let opt = Options::new(options).map_err(|e| e.with_regex(regex))?;
    Self::with_options(regex, opt)
  }

  /// Compiles `regex` under already-parsed options (the way to supply
  /// `{name}` macros).
  pub fn with_options(regex: &str, opt: Options) -> Result<Pattern> {
    let build = || -> Result<Pattern> {
      let parsed = Parser::parse_regex(regex, &opt)?;
      let mut dfa = Dfa::build(&parsed)?;
      let assembled = compiler::assemble(&mut dfa)?;
      let pred = Predictor::analyze(&dfa, &parsed);

      let (strategy, predict_kind, finder) = select_strategy(&pred, &opt);
      debug!(?strategy, ?predict_kind, opcodes = assembled.opcodes.len(), "pattern compiled");

      Ok(Pattern {
        rex: regex.to_string(),
        opt,
        opc: assembled.opcodes,
        pred,
        accept_count: parsed.accept_count,
        lookahead_count: parsed.lookaheads.len() as Lookahead16,
        strategy,
        predict_kind,
        finder,
        parse_time: parsed.parse_time,
        assemble_time: assembled.assemble_time,
      })
    };
    build().map_err(|e| e.with_regex(regex))
  }

  /// Reconstructs a pattern from a precompiled opcode table and its
  /// predictor blob. The blob's version tag and opcode fingerprint are
  /// verified before use.
  pub fn from_parts(opcodes: Vec<u32>, blob: &[u8]) -> Result<Pattern> {
    let pred = Predictor::decode(blob, &opcodes)?;

    let mut accept_count: Accept32 = 0;
    let mut lookahead_count: Lookahead16 = 0;
    for &w in opcodes.iter() {
      let op = Opcode(w);
      if op.is_take() {
        accept_count = accept_count.max(op.long_idx());
      } else if op.is_head() || op.is_tail() {
        lookahead_count = lookahead_count.max(op.lookahead() + 1);
      }
    }

    let opt = Options::default();
    let (strategy, predict_kind, finder) = select_strategy(&pred, &opt);

    Ok(Pattern {
      rex: String::new(),
      opt,
      opc: opcodes,
      pred,
      accept_count,
      lookahead_count,
      strategy,
      predict_kind,
      finder,
      parse_time: Duration::default(),
      assemble_time: Duration::default(),
    })
  }

  /// Serializes the predictor tables for later `from_parts` loading.
  pub fn save_predictor(&self) -> Vec<u8> {
    self.pred.encode(&self.opc)
  }

  // region accessors

  /// The regex string this pattern was compiled from (empty for
  /// precompiled patterns).
  pub fn regex(&self) -> &str {
    &self.rex
  }

  pub fn options(&self) -> &Options {
    &self.opt
  }

  /// The opcode table.
  pub fn opcodes(&self) -> &[u32] {
    &self.opc
  }

  pub(crate) fn predictor(&self) -> &Predictor {
    &self.pred
  }

  /// Number of top-level alternatives.
  pub fn accepts(&self) -> Accept32 {
    self.accept_count
  }

  /// Number of lookaheads in the pattern.
  pub fn lookaheads(&self) -> Lookahead16 {
    self.lookahead_count
  }

  /// The literal prefix all matches start with (may be empty).
  pub fn prefix(&self) -> &[u8] {
    match self.strategy {
      Strategy::PatternPin(_) => &[],
      _ => &self.pred.chr,
    }
  }

  /// Minimum length of a match, capped at 8.
  pub fn min_length(&self) -> u8 {
    self.pred.min
  }

  /// True when the pattern matches exactly one fixed string.
  pub fn one_string(&self) -> bool {
    self.pred.one
  }

  pub(crate) fn strategy(&self) -> Strategy {
    self.strategy
  }

  pub(crate) fn predict_kind(&self) -> PredictKind {
    self.predict_kind
  }

  pub(crate) fn finder(&self) -> Option<&memmem::Finder<'static>> {
    self.finder.as_ref()
  }

  pub fn parse_time(&self) -> Duration {
    self.parse_time
  }

  pub fn assemble_time(&self) -> Duration {
    self.assemble_time
  }

  // endregion
}

impl std::fmt::Debug for Pattern {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pattern")
      .field("regex", &self.rex)
      .field("opcodes", &self.opc.len())
      .field("accepts", &self.accept_count)
      .field("strategy", &self.strategy)
      .finish()
  }
}

/// Long prefixes at or above this length prefer Boyer-Moore over the
/// substring finder.
const BM_PREFER_LEN: usize = 24;

fn select_strategy(
  pred: &Predictor,
  opt: &Options,
) -> (Strategy, PredictKind, Option<memmem::Finder<'static>>) {
  let len = pred.chr.len();

  let strategy = if pred.pin >= 2 {
    Strategy::PatternPin(pred.pin)
  } else if len == 0 {
    match pred.min {
      0 => Strategy::Nothing,
      k => Strategy::PatternMin(k),
    }
  } else if len == 1 {
    Strategy::Char(pred.chr[0])
  } else if len <= 8 {
    Strategy::Chars
  } else if len >= BM_PREFER_LEN && pred.bmd > 0 {
    Strategy::StringBm
  } else {
    Strategy::String
  };

  let finder = match strategy {
    Strategy::String => Some(memmem::Finder::new(&pred.chr).into_owned()),
    _ => None,
  };

  // The predict assist only pays off past the prefix strategies.
  let predict_kind = match opt.predict {
    false => PredictKind::None,
    true => match pred.min {
      0..=3 => PredictKind::None,
      4..=7 => PredictKind::Pma,
      _     => PredictKind::Pmh,
    },
  };

  (strategy, predict_kind, finder)
}


#[cfg(test)]
mod test {
  use super::*;
  use crate::error::ErrorKind;

  #[test]
  fn compiles_and_reports_shape() {
    let pattern = Pattern::new("foo|bar", "").unwrap();
    assert_eq!(pattern.accepts(), 2);
    assert!(!pattern.opcodes().is_empty());
  }

  #[test]
  fn errors_carry_the_regex() {
    let err = Pattern::new("(a", "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MismatchedParens);
    assert_eq!(err.regex, "(a");
  }

  #[test]
  fn invalid_option_letter() {
    let err = Pattern::new("a", "k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidModifier);
  }

  #[test]
  fn strategy_selection() {
    assert_eq!(Pattern::new("x[ab]", "").unwrap().strategy(), Strategy::Char(b'x'));
    assert_eq!(Pattern::new("foobar[ab]", "").unwrap().strategy(), Strategy::Chars);
    assert_eq!(
      Pattern::new("abcdefghijklm[xy]", "").unwrap().strategy(),
      Strategy::String
    );
    assert_eq!(
      Pattern::new("he|she|his", "").unwrap().strategy(),
      Strategy::PatternPin(3)
    );
    assert!(matches!(
      Pattern::new("[a-c][d-f]x", "").unwrap().strategy(),
      Strategy::PatternMin(_)
    ));
    assert_eq!(Pattern::new("^x|y^", "").unwrap().strategy(), Strategy::Nothing);
  }

  #[test]
  fn predict_kind_follows_min_length() {
    let p = Pattern::new("[ab]cdef[gh]", "p").unwrap();
    assert_eq!(p.predict_kind(), PredictKind::Pma);
    let p = Pattern::new("[ab]cdefghijk[lm]", "p").unwrap();
    assert_eq!(p.predict_kind(), PredictKind::Pmh);
    let p = Pattern::new("[ab]cdef[gh]", "").unwrap();
    assert_eq!(p.predict_kind(), PredictKind::None);
  }

  #[test]
  fn precompiled_round_trip() {
    let original = Pattern::new("foo|bar|baz", "").unwrap();
    let blob = original.save_predictor();
    let reloaded = Pattern::from_parts(original.opcodes().to_vec(), &blob).unwrap();
    assert_eq!(reloaded.opcodes(), original.opcodes());
    assert_eq!(reloaded.accepts(), original.accepts());
    assert_eq!(reloaded.strategy(), original.strategy());
    assert_eq!(reloaded.min_length(), original.min_length());
  }

  #[test]
  fn precompiled_rejects_foreign_blob() {
    let a = Pattern::new("foo", "").unwrap();
    let b = Pattern::new("bar", "").unwrap();
    let blob = a.save_predictor();
    let err = Pattern::from_parts(b.opcodes().to_vec(), &blob).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CannotSaveTables);
  }
}
