/*!

  The fuzzy matcher overlay: reuses a compiled pattern's opcode table with
  bounded backtracking to admit up to *k* edits. The table is interpreted
  unchanged; at every position where the next input byte has no transition
  (where the exact VM would halt) the overlay records a backtrack point and
  tries, in order:

  1. **insertion** - the input has an extra byte: skip it;
  2. **substitution** - consume the byte and take a transition anyway;
  3. **deletion** - the input is missing a byte: take a transition without
     consuming.

  Edit kinds are individually enabled by [`FuzzyFlags`]. Unless `BIN` is
  set, a multi-byte UTF-8 sequence counts as one edit. When a fuzzy match
  used edits, a second pass re-runs the exact VM from the same start; an
  exact match supersedes. The reported edit count is the number of edits on
  the successful path, an upper bound rather than a guaranteed minimum.

*/

use bitflags::bitflags;

use crate::input::Input;
use crate::matcher::Matcher;
use crate::opcode::{bitmasks, Opcode};
use crate::pattern::Pattern;
use crate::{Accept32, Lookahead16, REDO_ACCEPT};

bitflags! {
  /// Which edit kinds the overlay may spend its budget on.
  #[derive(Copy, Clone, Eq, PartialEq, Debug)]
  pub struct FuzzyFlags: u8 {
    /// An extra byte in the input.
    const INS = 0b0001;
    /// A byte missing from the input.
    const DEL = 0b0010;
    /// A byte differing from the pattern.
    const SUB = 0b0100;
    /// Treat input as binary: edits are per byte, not per UTF-8 character.
    const BIN = 0b1000;
  }
}

#[derive(Copy, Clone, Debug)]
pub struct FuzzyOptions {
  pub max_edits: u8,
  pub flags: FuzzyFlags,
}

impl Default for FuzzyOptions {
  fn default() -> Self {
    FuzzyOptions {
      max_edits: 1,
      flags: FuzzyFlags::INS | FuzzyFlags::DEL | FuzzyFlags::SUB,
    }
  }
}

/// A choice point: the state and input position where an edit was (or can
/// be) applied, and which alternative to try next.
#[derive(Copy, Clone, Debug)]
struct BacktrackPoint {
  pc: usize,      //< opcode offset of the state
  pos_rel: usize, //< input offset relative to the match start
  err: u8,        //< edits consumed before this point
  alt: u8,        //< 0 = insertion, 1 = substitution, 2 = deletion
}

pub struct FuzzyMatcher<'p> {
  m: Matcher<'p>,
  k: u8,
  flags: FuzzyFlags,
  edits: u8,
}

impl<'p> FuzzyMatcher<'p> {

  pub fn new(pat: &'p Pattern, opts: FuzzyOptions) -> FuzzyMatcher<'p> {
    FuzzyMatcher {
      m: Matcher::new(pat),
      k: opts.max_edits,
      flags: opts.flags,
      edits: 0,
    }
  }

  pub fn with_input<I: Into<Input>>(pat: &'p Pattern, opts: FuzzyOptions, input: I) -> FuzzyMatcher<'p> {
    let mut f = FuzzyMatcher::new(pat, opts);
    f.m.input(input);
    f
  }

  pub fn input<I: Into<Input>>(&mut self, input: I) -> &mut Self {
    self.m.input(input);
    self.edits = 0;
    self
  }

  pub fn reset(&mut self, opts: &str) -> &mut Self {
    self.m.reset(opts);
    self.edits = 0;
    self
  }

  /// The wrapped exact matcher (positional queries, handlers, etc.).
  pub fn matcher(&mut self) -> &mut Matcher<'p> {
    &mut self.m
  }

  // region match accessors

  pub fn accept(&self) -> Accept32 {
    self.m.accept()
  }

  pub fn text_bytes(&self) -> &[u8] {
    self.m.text_bytes()
  }

  pub fn text(&self) -> std::borrow::Cow<'_, str> {
    self.m.text()
  }

  pub fn begin(&self) -> u64 {
    self.m.begin()
  }

  pub fn size(&self) -> usize {
    self.m.size()
  }

  /// Edits consumed by the last match (an upper bound).
  pub fn edits(&self) -> u8 {
    self.edits
  }

  // endregion

  /// Searches forward for the next match within the edit budget.
  pub fn find(&mut self) -> Accept32 {
    loop {
      self.m.buf.txt = self.m.buf.cur;
      self.m.buf.mrk = self.m.buf.cur;

      let matched = self.attempt_with_refinement();
      let suppressed = self.m.cap == REDO_ACCEPT;

      if matched && !suppressed && self.m.buf.cur > self.m.buf.mrk {
        self.m.mlen = self.m.buf.cur - self.m.buf.txt;
        return self.m.cap;
      }
      if self.m.buf.mrk >= self.m.buf.end && self.m.buf.at_eof() {
        self.m.cap = 0;
        return 0;
      }
      self.m.buf.cur = self.m.buf.mrk + 1;
    }
  }

  /// Anchored tokenize within the edit budget; rejects empty matches.
  pub fn scan(&mut self) -> Accept32 {
    self.m.buf.txt = self.m.buf.cur;
    self.m.buf.mrk = self.m.buf.cur;
    let matched = self.attempt_with_refinement();
    if matched && self.m.cap != REDO_ACCEPT && self.m.buf.cur > self.m.buf.mrk {
      self.m.mlen = self.m.buf.cur - self.m.buf.txt;
      return self.m.cap;
    }
    self.m.cap = 0;
    self.m.buf.cur = self.m.buf.txt;
    0
  }

  /// True iff the entire input matches within the edit budget.
  pub fn matches(&mut self) -> bool {
    self.m.buf.txt = self.m.buf.cur;
    self.m.buf.mrk = self.m.buf.cur;
    let matched = self.attempt_with_refinement();
    matched
      && self.m.cap != REDO_ACCEPT
      && self.m.buf.cur >= self.m.buf.end
      && self.m.buf.at_eof()
  }

  /// A fuzzy attempt, refined by an exact re-run when edits were spent.
  fn attempt_with_refinement(&mut self) -> bool {
    let matched = self.fuzzy_attempt();
    if matched && self.edits > 0 {
      let fuzzy_cap = self.m.cap;
      let fuzzy_cur = self.m.buf.cur;
      let fuzzy_edits = self.edits;

      let opc = self.m.pattern().opcodes();
      self.m.attempt(opc);
      if self.m.cap != 0 {
        self.edits = 0;
      } else {
        self.m.cap = fuzzy_cap;
        self.m.buf.cur = fuzzy_cur;
        self.edits = fuzzy_edits;
      }
    }
    matched
  }

  /// The backtracking interpreter: the exact VM loop with an edit budget
  /// spent at transition failures.
  fn fuzzy_attempt(&mut self) -> bool {
    let pat: &'p Pattern = self.m.pattern();
    let opc: &'p [u32] = pat.opcodes();

    self.m.cap = 0;
    self.m.buf.pos = self.m.buf.mrk;
    self.m.buf.cur = self.m.buf.mrk;
    for l in self.m.lap.iter_mut() {
      *l = -1;
    }
    self.m.la_closed.clear();
    self.edits = 0;

    let mut stack: Vec<BacktrackPoint> = Vec::new();
    let mut pc: usize = 0;
    let mut err: u8 = 0;

    'state: loop {
      let op = Opcode(opc[pc]);

      if op.is_take() {
        let a = op.long_idx();
        if self.m.cap == 0
          || a < self.m.cap
          || (a == self.m.cap && self.m.buf.pos > self.m.buf.cur)
        {
          self.m.cap = a;
          self.m.buf.cur = self.m.buf.pos;
          self.edits = err;
        }
        pc += 1;
        continue;
      }
      if op.is_redo() {
        if self.m.cap == 0 {
          self.m.cap = REDO_ACCEPT;
          self.m.buf.cur = self.m.buf.pos;
          self.edits = err;
        }
        pc += 1;
        continue;
      }
      if op.is_head() {
        let la = op.lookahead() as usize;
        if la < self.m.lap.len() {
          self.m.lap[la] = (self.m.buf.pos - self.m.buf.mrk) as i64;
        }
        pc += 1;
        continue;
      }
      if op.is_tail() {
        let la = op.lookahead() as usize;
        if la < self.m.lap.len() && self.m.lap[la] >= 0 {
          self.m.buf.cur = self.m.buf.mrk + self.m.lap[la] as usize;
          self.m.la_closed.push(la as Lookahead16);
        }
        pc += 1;
        continue;
      }
      if op.is_meta() {
        let wide = op.idx() as u32 == bitmasks::LONG_MARKER;
        let target = match wide {
          true  => Opcode(opc[pc + 1]).long_idx() as usize,
          false => op.idx() as usize,
        };
        if self.m.meta_holds(op.meta()) {
          pc = target;
        } else {
          pc += if wide { 2 } else { 1 };
        }
        continue;
      }

      // Byte dispatch.
      let pc_state = pc;
      if let Some(c) = self.m.peek_byte() {
        let mut scan_pc = pc;
        loop {
          let op = Opcode(opc[scan_pc]);
          if op.is_halt() {
            break; // transition failure
          }
          let wide = op.idx() as u32 == bitmasks::LONG_MARKER;
          if op.is_goto_u8(c) {
            if op.idx() as u32 == bitmasks::HALT_MARKER {
              break;
            }
            let target = match wide {
              true  => Opcode(opc[scan_pc + 1]).long_idx() as usize,
              false => op.idx() as usize,
            };
            self.m.buf.pos += 1;
            pc = target;
            continue 'state;
          }
          scan_pc += if wide { 2 } else { 1 };
        }
      }

      // No transition for the next byte (or end of input): spend an edit
      // or backtrack.
      let mut resume = BacktrackPoint {
        pc: pc_state,
        pos_rel: self.m.buf.pos - self.m.buf.mrk,
        err,
        alt: 0,
      };

      loop {
        // The first pattern character must match exactly: an edit budget
        // spent before any progress would make every position a match.
        if resume.pos_rel == 0 || resume.err >= self.k || resume.alt >= 3 {
          match stack.pop() {
            Some(bt) => {
              resume = BacktrackPoint { alt: bt.alt + 1, ..bt };
              continue;
            }
            None => {
              return self.m.cap != 0;
            }
          }
        }

        self.m.buf.pos = self.m.buf.mrk + resume.pos_rel;
        let applied: Option<usize> = match resume.alt {
          0 => {
            // Insertion: the input has an extra character; skip it.
            match self.flags.contains(FuzzyFlags::INS) && self.m.peek_byte().is_some() {
              true => {
                self.consume_edit_char();
                Some(resume.pc)
              }
              false => None,
            }
          }
          1 => {
            // Substitution: consume the character and transition anyway.
            match self.flags.contains(FuzzyFlags::SUB) && self.m.peek_byte().is_some() {
              true => byte_target(opc, resume.pc).map(|t| {
                self.consume_edit_char();
                t
              }),
              false => None,
            }
          }
          _ => {
            // Deletion: the input is missing a pattern character.
            match self.flags.contains(FuzzyFlags::DEL) {
              true  => byte_target(opc, resume.pc),
              false => None,
            }
          }
        };

        match applied {
          Some(new_pc) => {
            err = resume.err + 1;
            stack.push(resume);
            pc = new_pc;
            continue 'state;
          }
          None => {
            resume.alt += 1;
          }
        }
      }
    }
  }

  /// Consumes one character at the read head for an edit: one byte in
  /// binary mode, a whole UTF-8 sequence otherwise.
  fn consume_edit_char(&mut self) {
    self.m.buf.pos += 1;
    if self.flags.contains(FuzzyFlags::BIN) {
      return;
    }
    for _ in 0..3 {
      match self.m.peek_byte() {
        Some(b) if b & 0xC0 == 0x80 => {
          self.m.buf.pos += 1;
        }
        _ => break,
      }
    }
  }
}

/// The first live byte-GOTO target of the state starting at `pc`, if any.
fn byte_target(opc: &[u32], mut pc: usize) -> Option<usize> {
  loop {
    let op = Opcode(opc[pc]);
    if op.is_take() || op.is_redo() || op.is_head() || op.is_tail() {
      pc += 1;
      continue;
    }
    if op.is_meta() {
      pc += if op.idx() as u32 == bitmasks::LONG_MARKER { 2 } else { 1 };
      continue;
    }
    if op.is_halt() {
      return None;
    }
    let wide = op.idx() as u32 == bitmasks::LONG_MARKER;
    if op.idx() as u32 == bitmasks::HALT_MARKER {
      pc += 1;
      continue;
    }
    return match wide {
      true  => Some(Opcode(opc[pc + 1]).long_idx() as usize),
      false => Some(op.idx() as usize),
    };
  }
}


#[cfg(test)]
mod test {
  use super::*;

  fn fuzzy(regex: &str, k: u8, input: &str) -> FuzzyMatcher<'static> {
    // Tests leak the pattern to keep the borrow simple.
    let pat: &'static Pattern = Box::leak(Box::new(Pattern::new(regex, "").unwrap()));
    FuzzyMatcher::with_input(
      pat,
      FuzzyOptions { max_edits: k, ..FuzzyOptions::default() },
      input,
    )
  }

  #[test]
  fn exact_match_costs_nothing() {
    let mut f = fuzzy("color", 1, "my color here");
    assert_eq!(f.find(), 1);
    assert_eq!(f.text(), "color");
    assert_eq!(f.edits(), 0);
  }

  #[test]
  fn one_insertion_matches_colour() {
    let mut f = fuzzy("color", 1, "colour");
    assert_eq!(f.find(), 1);
    assert_eq!(f.text(), "colour");
    assert_eq!(f.edits(), 1);
  }

  #[test]
  fn one_substitution() {
    let mut f = fuzzy("abcd", 1, "xx abXd yy");
    assert_eq!(f.find(), 1);
    assert_eq!(f.edits(), 1);
  }

  #[test]
  fn one_deletion() {
    let mut f = fuzzy("abcd", 1, "xx abd yy");
    assert_eq!(f.find(), 1);
    assert_eq!(f.edits(), 1);
  }

  #[test]
  fn budget_is_respected() {
    // Two edits needed, only one allowed.
    let mut f = fuzzy("abcdef", 1, "abXdeX");
    assert_eq!(f.find(), 0);
  }

  #[test]
  fn monotonic_in_the_budget() {
    // Matching at k implies matching at every k' >= k.
    for k in 1..=3u8 {
      let mut f = fuzzy("kitten", k, "xx sitten yy");
      assert_eq!(f.find(), 1, "k={}", k);
      assert!(f.edits() <= k);
    }
  }

  #[test]
  fn edit_kind_flags_restrict() {
    let pat: &'static Pattern = Box::leak(Box::new(Pattern::new("abcd", "").unwrap()));

    // Substitution-only cannot fix a deletion.
    let mut f = FuzzyMatcher::with_input(
      pat,
      FuzzyOptions { max_edits: 1, flags: FuzzyFlags::SUB },
      "xx abd yy",
    );
    assert_eq!(f.find(), 0);

    // Deletion-only can.
    let mut f = FuzzyMatcher::with_input(
      pat,
      FuzzyOptions { max_edits: 1, flags: FuzzyFlags::DEL },
      "xx abd yy",
    );
    assert_eq!(f.find(), 1);
    assert_eq!(f.edits(), 1);
  }

  #[test]
  fn utf8_sequence_is_one_edit() {
    // A two-byte UTF-8 character substituted into the input counts once.
    let mut f = fuzzy("naive", 1, "na\u{EF}ve");
    assert_eq!(f.find(), 1);
    assert_eq!(f.edits(), 1);
  }

  #[test]
  fn exact_supersedes_fuzzy() {
    // Both "colr" (1 edit) and "color" (exact) appear; finds are reported
    // left to right, each with its own edit count.
    let mut f = fuzzy("color", 1, "colr color");
    assert_eq!(f.find(), 1);
    assert_eq!(f.edits(), 1);
    assert_eq!(f.find(), 1);
    assert_eq!(f.edits(), 0);
    assert_eq!(f.text(), "color");
  }

  #[test]
  fn anchored_scan_and_matches() {
    let mut f = fuzzy("hello", 1, "hellp");
    assert!(f.matches());

    let mut f = fuzzy("hello", 1, "hellp there");
    assert_eq!(f.scan(), 1);
    assert!(f.size() >= 5);
  }
}
