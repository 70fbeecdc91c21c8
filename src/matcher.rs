/*!

  The execution VM. A `Matcher` borrows a compiled [`Pattern`], owns its
  buffer and cursors, and interprets the opcode table with one loop keyed on
  the match method:

  * **SCAN** - tokenize, anchored at the current position;
  * **FIND** - search forward for the next match, using the pattern's
    prefilter strategy to advance to candidate start positions;
  * **SPLIT** - yield the text between matches;
  * **MATCH** - whole-input anchored match.

  Matches are reported in strict left-to-right order; ties at the same start
  resolve to the lowest-numbered alternative, and ties on alternative to the
  longest match, except lazy-quantifier subgraphs which take the shortest
  path through them.

  A matcher is not thread-safe; clone the pattern reference into a fresh
  matcher per thread instead.

*/

use std::borrow::Cow;

use memchr::memchr;
use tracing::warn;

use crate::buffer::{Buffer, ShiftHandler};
use crate::character::{Char, Meta};
use crate::input::Input;
use crate::opcode::{bitmasks, Opcode};
use crate::pattern::Pattern;
use crate::{Accept32, Lookahead16, EMPTY_ACCEPT, REDO_ACCEPT};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Method {
  Scan,
  Find,
  Split,
  Match,
}

/// Positional context saved by `push_matcher`. Offsets are absolute input
/// positions so a buffer shift between push and pop cannot invalidate them.
#[derive(Clone, Debug)]
struct SavedContext {
  txt : u64,
  cur : u64,
  pos : u64,
  cap : Accept32,
  mlen: usize,
}

pub struct Matcher<'p> {
  pat: &'p Pattern,
  pub(crate) buf: Buffer,
  inp: Input,
  handler: Option<ShiftHandler>,

  pub(crate) cap : Accept32, //< accept code of the last match, 0 if none
  pub(crate) mlen: usize,    //< length of the last match (or split piece)

  pub(crate) lap      : Vec<i64>,         //< lookahead offsets relative to match start; -1 unset
  pub(crate) la_closed: Vec<Lookahead16>, //< lookaheads committed by TAIL in the last match

  // reset options
  opt_a: bool, //< 'A': accept negative-pattern (redo) matches
  opt_n: bool, //< 'N': nullable find reports empty matches
  opt_w: bool, //< 'W': word-boundary half-check

  bump_next : bool, //< skip one byte before the next find (after empty match)
  more_pending: bool,
  split_done: bool,

  tab_stops  : Vec<usize>,
  stops_stack: Vec<Vec<usize>>,
  context_stack: Vec<SavedContext>,
}

impl<'p> Matcher<'p> {

  pub fn new(pat: &'p Pattern) -> Matcher<'p> {
    let lookaheads = pat.lookaheads() as usize;
    Matcher {
      pat,
      buf: Buffer::new(),
      inp: Input::empty(),
      handler: None,
      cap: 0,
      mlen: 0,
      lap: vec![-1; lookaheads],
      la_closed: Vec::new(),
      opt_a: false,
      opt_n: false,
      opt_w: false,
      bump_next: false,
      more_pending: false,
      split_done: false,
      tab_stops: Vec::new(),
      stops_stack: Vec::new(),
      context_stack: Vec::new(),
    }
  }

  /// Shorthand: a matcher over string or byte input.
  pub fn with_input<I: Into<Input>>(pat: &'p Pattern, input: I) -> Matcher<'p> {
    let mut m = Matcher::new(pat);
    m.input(input);
    m
  }

  pub fn pattern(&self) -> &'p Pattern {
    self.pat
  }

  // region input plumbing

  /// Sets the input source and clears all match state.
  pub fn input<I: Into<Input>>(&mut self, input: I) -> &mut Self {
    self.inp = input.into();
    self.buf.reset();
    self.clear_match_state();
    self
  }

  /// Installs the entire input up front, as for scan-in-place matching; no
  /// further reads occur.
  pub fn buffer(&mut self, base: &[u8]) -> &mut Self {
    self.inp = Input::empty();
    self.buf.assign(base);
    self.clear_match_state();
    self
  }

  /// Clears match state. Option letters: `A` (accept redo matches), `N`
  /// (nullable find), `W` (word-boundary half-check), `T=d` (tab width,
  /// d in {1,2,4,8}). Reset never fails; unknown letters are ignored with a
  /// warning.
  pub fn reset(&mut self, opts: &str) -> &mut Self {
    self.opt_a = false;
    self.opt_n = false;
    self.opt_w = false;
    self.buf.set_tab(8);

    let bytes = opts.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
      match bytes[i] {
        b'A' => self.opt_a = true,
        b'N' => self.opt_n = true,
        b'W' => self.opt_w = true,
        b'T' => {
          if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
            i += 1;
          }
          if i + 1 < bytes.len() && matches!(bytes[i + 1], b'1' | b'2' | b'4' | b'8') {
            i += 1;
            self.buf.set_tab(bytes[i] - b'0');
          }
        }
        b' ' | b';' | b',' => {}
        other => {
          warn!(letter = %(other as char), "ignoring unknown reset option");
        }
      }
      i += 1;
    }

    self.buf.reset();
    self.clear_match_state();
    self
  }

  fn clear_match_state(&mut self) {
    self.cap = 0;
    self.mlen = 0;
    for l in self.lap.iter_mut() {
      *l = -1;
    }
    self.la_closed.clear();
    self.bump_next = false;
    self.more_pending = false;
    self.split_done = false;
    self.tab_stops.clear();
  }

  /// Registers the buffer-shift callback, invoked with the displaced byte
  /// count just before internal offsets are rebased. The handler must not
  /// re-enter the matcher.
  pub fn set_handler<F: FnMut(usize) + 'static>(&mut self, f: F) -> &mut Self {
    self.handler = Some(Box::new(f));
    self
  }

  pub(crate) fn fill_more(&mut self) -> bool {
    let inp = &mut self.inp;
    self.buf.fill(|b| inp.read(b), &mut self.handler)
  }

  /// The byte at the read head, filling from the input as needed.
  pub(crate) fn peek_byte(&mut self) -> Option<u8> {
    while self.buf.pos >= self.buf.end {
      if !self.fill_more() {
        return None;
      }
    }
    Some(self.buf.byte(self.buf.pos))
  }

  /// The byte just before the read head; `None` at the beginning of input
  /// or when the byte was shifted away.
  fn prev_byte(&self) -> Option<u8> {
    match self.buf.pos {
      0 => None,
      p => Some(self.buf.byte(p - 1)),
    }
  }

  // endregion

  // region matcher operations

  /// Anchored tokenize: matches at the current position, rejecting empty
  /// matches. Returns the accept code or 0.
  pub fn scan(&mut self) -> Accept32 {
    self.interpret(Method::Scan)
  }

  /// Searches forward for the next match. Returns the accept code or 0.
  pub fn find(&mut self) -> Accept32 {
    self.interpret(Method::Find)
  }

  /// True iff the entire (buffered) input matches.
  pub fn matches(&mut self) -> bool {
    self.interpret(Method::Match) != 0
  }

  /// Yields the text up to the next match. After the last match the
  /// remaining text is emitted with accept code [`EMPTY_ACCEPT`], then 0.
  pub fn split(&mut self) -> Accept32 {
    if self.split_done {
      return 0;
    }
    self.buf.txt = self.buf.cur;
    let r = self.interpret(Method::Split);
    if r != 0 {
      return r;
    }
    self.split_done = true;
    self.cap = EMPTY_ACCEPT;
    self.mlen = self.buf.end - self.buf.txt;
    self.buf.cur = self.buf.end;
    EMPTY_ACCEPT
  }

  /// Extends the next match to include the current one.
  pub fn more(&mut self) {
    self.more_pending = true;
  }

  /// Truncates the current match to `n` bytes; matching resumes after the
  /// truncated text.
  pub fn less(&mut self, n: usize) {
    if n < self.mlen {
      self.mlen = n;
      self.buf.cur = self.buf.txt + n;
    }
  }

  /// Puts byte `c` back in front of the next match position.
  pub fn unput(&mut self, c: u8) {
    if self.buf.cur > 0 {
      self.buf.cur -= 1;
      self.buf.set_byte(self.buf.cur, c);
      self.mlen = self.mlen.saturating_sub(1);
    }
  }

  /// Fast-forwards until byte `c` has been consumed. Returns false when
  /// the input ends first.
  pub fn skip(&mut self, c: u8) -> bool {
    loop {
      if let Some(off) = memchr(c, self.buf.slice(self.buf.cur, self.buf.end)) {
        self.buf.cur += off + 1;
        self.buf.txt = self.buf.cur;
        self.mlen = 0;
        return true;
      }
      self.buf.cur = self.buf.end;
      self.buf.txt = self.buf.cur;
      if !self.fill_more() {
        return false;
      }
    }
  }

  /// Fast-forwards until the string `s` has been consumed.
  pub fn skip_str(&mut self, s: &[u8]) -> bool {
    if s.is_empty() {
      return true;
    }
    loop {
      let hay = self.buf.slice(self.buf.cur, self.buf.end);
      if let Some(off) = memchr::memmem::find(hay, s) {
        self.buf.cur += off + s.len();
        self.buf.txt = self.buf.cur;
        self.mlen = 0;
        return true;
      }
      // Keep a window overlap so a needle spanning the refill is found.
      let keep = s.len().saturating_sub(1).min(self.buf.end - self.buf.cur);
      self.buf.cur = self.buf.end - keep;
      self.buf.txt = self.buf.cur;
      if !self.fill_more() {
        return false;
      }
    }
  }

  /// Saves the positional context for a nested scan on the same buffer.
  pub fn push_matcher(&mut self) {
    self.context_stack.push(SavedContext {
      txt: self.buf.offset(self.buf.txt),
      cur: self.buf.offset(self.buf.cur),
      pos: self.buf.offset(self.buf.pos),
      cap: self.cap,
      mlen: self.mlen,
    });
  }

  /// Restores the most recently pushed context; false when none remain. A
  /// context whose text has since been shifted out of the buffer restores
  /// clamped to the buffer front.
  pub fn pop_matcher(&mut self) -> bool {
    match self.context_stack.pop() {
      Some(ctx) => {
        let base = self.buf.shifted();
        self.buf.txt = ctx.txt.saturating_sub(base) as usize;
        self.buf.cur = ctx.cur.saturating_sub(base) as usize;
        self.buf.pos = ctx.pos.saturating_sub(base) as usize;
        self.cap = ctx.cap;
        self.mlen = ctx.mlen;
        true
      }
      None => false,
    }
  }

  /// Saves the indent tab-stop stack for a nested context.
  pub fn push_stops(&mut self) {
    self.stops_stack.push(std::mem::take(&mut self.tab_stops));
  }

  /// Restores the most recently pushed tab stops; false when none remain.
  pub fn pop_stops(&mut self) -> bool {
    match self.stops_stack.pop() {
      Some(stops) => {
        self.tab_stops = stops;
        true
      }
      None => false,
    }
  }

  // endregion

  // region match accessors

  /// Accept code of the last match: 0 (none), 1..N (alternative),
  /// [`REDO_ACCEPT`], or [`EMPTY_ACCEPT`].
  pub fn accept(&self) -> Accept32 {
    self.cap
  }

  /// The matched bytes (or split piece).
  pub fn text_bytes(&self) -> &[u8] {
    self.buf.slice(self.buf.txt, self.buf.txt + self.mlen)
  }

  /// The matched text, lossily decoded.
  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(self.text_bytes())
  }

  /// Absolute input offset of the match begin.
  pub fn begin(&self) -> u64 {
    self.buf.offset(self.buf.txt)
  }

  /// Length of the match in bytes.
  pub fn size(&self) -> usize {
    self.mlen
  }

  /// Edit count of the last match; always 0 for the exact matcher.
  pub fn edits(&self) -> u8 {
    0
  }

  /// Lookahead ids that closed during the last match, with their (unset)
  /// names, smallest id first.
  pub fn groups(&self) -> impl Iterator<Item = (Lookahead16, Option<&str>)> + '_ {
    let mut ids = self.la_closed.clone();
    ids.sort_unstable();
    ids.dedup();
    ids.into_iter().map(|id| (id, None))
  }

  // endregion

  // region positional queries

  /// 1-based line number of the match begin.
  pub fn lineno(&mut self) -> usize {
    let txt = self.buf.txt;
    self.buf.lineno_at(txt)
  }

  /// 0-based (tab-expanded) column of the match begin.
  pub fn columno(&self) -> usize {
    self.buf.columno_at(self.buf.txt)
  }

  /// 1-based line number of the match end.
  pub fn lineno_end(&mut self) -> usize {
    let end = self.buf.txt + self.mlen;
    self.buf.lineno_at(end)
  }

  /// 0-based column of the match end.
  pub fn columno_end(&self) -> usize {
    self.buf.columno_at(self.buf.txt + self.mlen)
  }

  /// Number of lines the match spans (at least 1).
  pub fn lines(&mut self) -> usize {
    self.lineno_end() - self.lineno() + 1
  }

  /// Number of columns the match spans.
  pub fn columns(&mut self) -> usize {
    if self.lines() == 1 {
      self.columno_end() - self.columno()
    } else {
      self.columno_end()
    }
  }

  /// Byte offset of the match begin from the start of its line.
  pub fn border(&self) -> usize {
    self.buf.txt - self.buf.line_begin(self.buf.txt)
  }

  /// The bytes from the begin of the match's line up to the match.
  pub fn bol(&self) -> &[u8] {
    self.buf.slice(self.buf.line_begin(self.buf.txt), self.buf.txt)
  }

  /// The bytes from the match end to the end of its line; `inclusive`
  /// includes the newline.
  pub fn eol(&self, inclusive: bool) -> &[u8] {
    let from = self.buf.txt + self.mlen;
    let mut to = self.buf.line_end(from);
    if inclusive && to < self.buf.end {
      to += 1;
    }
    self.buf.slice(from, to)
  }

  /// The whole line (or lines) containing the match, without the final
  /// newline.
  pub fn span(&self) -> &[u8] {
    let from = self.buf.line_begin(self.buf.txt);
    let to = self.buf.line_end(self.buf.txt + self.mlen);
    self.buf.slice(from, to)
  }

  /// `span()` decoded as text.
  pub fn line(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(self.span())
  }

  // endregion

  // region iterators

  /// Iterates `(accept, text)` over all remaining finds.
  pub fn find_iter(&mut self) -> Matches<'_, 'p> {
    Matches { m: self, method: Method::Find }
  }

  /// Iterates `(accept, text)` over all remaining scans (stops at the
  /// first gap).
  pub fn scan_iter(&mut self) -> Matches<'_, 'p> {
    Matches { m: self, method: Method::Scan }
  }

  /// Iterates `(accept, piece)` over all split pieces.
  pub fn split_iter(&mut self) -> Matches<'_, 'p> {
    Matches { m: self, method: Method::Split }
  }

  // endregion

  // region the interpreter

  /// One search step of the VM for the given method. Returns the accept
  /// code, 0 for no (more) matches.
  fn interpret(&mut self, method: Method) -> Accept32 {
    let pat: &'p Pattern = self.pat;
    let opc: &'p [u32] = pat.opcodes();

    if self.bump_next {
      self.bump_next = false;
      while self.buf.cur >= self.buf.end {
        if self.buf.at_eof() || !self.fill_more() {
          self.cap = 0;
          return 0;
        }
      }
      self.buf.cur += 1;
    }

    loop {
      if method == Method::Find || method == Method::Split {
        let track_txt = method == Method::Find && !self.more_pending;
        if !self.advance(track_txt) {
          self.cap = 0;
          return 0;
        }
      }
      if method != Method::Split && !self.more_pending {
        self.buf.txt = self.buf.cur;
      }
      self.buf.mrk = self.buf.cur;

      self.attempt(opc);

      let suppressed = self.cap == REDO_ACCEPT && !self.opt_a;
      let matched = self.cap != 0 && !suppressed;

      match method {
        Method::Match => {
          // Whole input: the accepting end must be the end of input.
          if matched && self.buf.cur >= self.buf.end && self.buf.at_eof() {
            self.mlen = self.buf.cur - self.buf.txt;
            self.more_pending = false;
            return self.cap;
          }
          self.cap = 0;
          self.mlen = 0;
          self.buf.cur = self.buf.txt;
          return 0;
        }
        Method::Scan => {
          // Tokenizing rejects empty matches.
          if matched && self.buf.cur > self.buf.mrk {
            self.mlen = self.buf.cur - self.buf.txt;
            self.more_pending = false;
            return self.cap;
          }
          self.cap = 0;
          self.mlen = 0;
          self.buf.cur = self.buf.txt;
          return 0;
        }
        Method::Find | Method::Split => {
          if matched {
            if self.buf.cur == self.buf.mrk {
              // Empty match.
              if self.opt_n {
                self.mlen = match method {
                  Method::Split => self.buf.mrk - self.buf.txt,
                  _ => 0,
                };
                self.more_pending = false;
                self.bump_next = true;
                return self.cap;
              }
              if self.buf.mrk >= self.buf.end && self.buf.at_eof() {
                self.cap = 0;
                return 0;
              }
              self.buf.cur = self.buf.mrk + 1;
              continue;
            }
            self.mlen = match method {
              Method::Split => self.buf.mrk - self.buf.txt,
              _ => self.buf.cur - self.buf.txt,
            };
            self.more_pending = false;
            return self.cap;
          }
          // No match at this candidate.
          if self.buf.mrk >= self.buf.end && self.buf.at_eof() {
            self.cap = 0;
            return 0;
          }
          self.buf.cur = self.buf.mrk + 1;
          continue;
        }
      }
    }
  }

  /// Anchored attempt at `buf.mrk`: runs the opcode program, leaving the
  /// last saved accept in `cap` and the accepting end in `buf.cur`.
  pub(crate) fn attempt(&mut self, opc: &[u32]) {
    self.cap = 0;
    self.buf.pos = self.buf.mrk;
    self.buf.cur = self.buf.mrk;
    for l in self.lap.iter_mut() {
      *l = -1;
    }
    self.la_closed.clear();

    let mut pc: usize = 0;

    'state: loop {
      let op = Opcode(opc[pc]);

      if op.is_take() {
        // First-match priority: a lower-numbered alternative shadows a
        // higher one, even a longer higher one; the same alternative
        // extends to its longest match and never shrinks.
        let a = op.long_idx();
        if self.cap == 0 || a < self.cap || (a == self.cap && self.buf.pos > self.buf.cur) {
          self.cap = a;
          self.buf.cur = self.buf.pos;
        }
        pc += 1;
        continue;
      }
      if op.is_redo() {
        if self.cap == 0 {
          self.cap = REDO_ACCEPT;
          self.buf.cur = self.buf.pos;
        }
        pc += 1;
        continue;
      }
      if op.is_head() {
        let la = op.lookahead() as usize;
        if la < self.lap.len() {
          self.lap[la] = (self.buf.pos - self.buf.mrk) as i64;
        }
        pc += 1;
        continue;
      }
      if op.is_tail() {
        let la = op.lookahead() as usize;
        if la < self.lap.len() && self.lap[la] >= 0 {
          self.buf.cur = self.buf.mrk + self.lap[la] as usize;
          self.la_closed.push(la as Lookahead16);
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
        if self.meta_holds(op.meta()) {
          pc = target;
        } else {
          pc += if wide { 2 } else { 1 };
        }
        continue;
      }

      // Byte dispatch: the remaining words of the state are byte GOTOs
      // (with HALT as the catch-all dead transition).
      let c = match self.peek_byte() {
        Some(c) => c,
        None => break 'state,
      };

      loop {
        let op = Opcode(opc[pc]);
        if op.is_halt() {
          break 'state;
        }
        let wide = op.idx() as u32 == bitmasks::LONG_MARKER;
        if op.is_goto_u8(c) {
          if op.idx() as u32 == bitmasks::HALT_MARKER {
            break 'state;
          }
          let target = match wide {
            true  => Opcode(opc[pc + 1]).long_idx() as usize,
            false => op.idx() as usize,
          };
          self.buf.pos += 1;
          pc = target;
          continue 'state;
        }
        pc += if wide { 2 } else { 1 };
      }
    }
  }

  /// Evaluates the anchor predicate for a meta symbol at the read head.
  /// Zero-width: no input is consumed.
  pub(crate) fn meta_holds(&mut self, meta: Char) -> bool {
    match meta {
      Meta::BeginningOfBuffer => self.buf.pos == 0 && self.buf.shifted() == 0,
      Meta::EndOfBuffer => self.peek_byte().is_none(),
      Meta::BeginningOfLine => {
        (self.buf.pos == 0 && self.buf.shifted() == 0) || self.prev_byte() == Some(b'\n')
      }
      Meta::EndOfLine => match self.peek_byte() {
        None => true,
        Some(c) => c == b'\n',
      },
      Meta::BeginWordBegin | Meta::BeginWordEnd => {
        let prev = is_word_byte(self.prev_byte());
        match self.opt_w {
          true  => !prev,
          false => !prev && is_word_byte(self.peek_byte()),
        }
      }
      Meta::EndWordBegin | Meta::EndWordEnd => {
        let prev = is_word_byte(self.prev_byte());
        match self.opt_w {
          true  => prev,
          false => prev && !is_word_byte(self.peek_byte()),
        }
      }
      Meta::NonWordBoundary | Meta::NonWordEnd => {
        let prev = is_word_byte(self.prev_byte());
        let next = is_word_byte(self.peek_byte());
        prev == next
      }
      Meta::IndentBoundary => {
        // Fires only at the end of the line's leading whitespace.
        let (ws_end, col) = self.buf.indent_info(self.buf.pos);
        let top = self.tab_stops.last().copied().unwrap_or(0);
        if self.buf.pos == ws_end && col > top {
          self.tab_stops.push(col);
          true
        } else {
          false
        }
      }
      Meta::DedentBoundary => {
        let (ws_end, col) = self.buf.indent_info(self.buf.pos);
        let top = self.tab_stops.last().copied().unwrap_or(0);
        if self.buf.pos == ws_end && col < top {
          self.tab_stops.pop();
          true
        } else {
          false
        }
      }
      Meta::UndentBoundary => {
        let (ws_end, col) = self.buf.indent_info(self.buf.pos);
        if self.buf.pos == ws_end && col == 0 && !self.tab_stops.is_empty() {
          self.tab_stops.clear();
          true
        } else {
          false
        }
      }
      _ => false,
    }
  }

  // endregion
}

/// Word characters for the boundary metas: ASCII alphanumerics, underscore,
/// and all non-ASCII bytes (UTF-8 letters).
fn is_word_byte(b: Option<u8>) -> bool {
  match b {
    Some(b) => b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80,
    None => false,
  }
}

/// Iterator over the remaining matches of one method, yielding
/// `(accept, matched bytes)`.
pub struct Matches<'m, 'p> {
  m: &'m mut Matcher<'p>,
  method: Method,
}

impl<'m, 'p> Iterator for Matches<'m, 'p> {
  type Item = (Accept32, Vec<u8>);

  fn next(&mut self) -> Option<Self::Item> {
    let r = match self.method {
      Method::Find => self.m.find(),
      Method::Scan => self.m.scan(),
      Method::Split => self.m.split(),
      Method::Match => return None,
    };
    match r {
      0 => None,
      accept => Some((accept, self.m.text_bytes().to_vec())),
    }
  }
}
