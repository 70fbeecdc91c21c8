/*!

  The growable shift-buffer the matcher reads through. Four cursors index
  into the buffer:

  ```text
  0 ...... txt ...... cur ...... pos ...... end ...... capacity
            |          |          |          |
            match    end of     VM read    filled
            start    last match  head       tail
  ```

  `num` is the count of bytes shifted out so far, so `num + offset` is the
  absolute input position of any cursor. Shifting reclaims space before
  `txt` (or before `bol` when begin-of-line retention is active, abandoned
  once the line exceeds a threshold); growth doubles capacity. Line and
  column counters are maintained lazily: newlines before `txt` are counted
  on demand and folded into a base count when the region shifts away.

*/

use memchr::{memchr_iter, memrchr};

use crate::limits::BUFSZ;

/// Invoked just before the buffer discards `gap` bytes from its front, so
/// user code holding offsets can observe the displacement. The handler must
/// not re-enter the matcher.
pub type ShiftHandler = Box<dyn FnMut(usize)>;

/// Begin-of-line retention is abandoned for the current match when the line
/// prefix exceeds this many bytes.
const BOL_ABANDON: usize = 3 * BUFSZ;

#[derive(Default)]
pub struct Buffer {
  buf: Vec<u8>,

  pub txt: usize, //< current match start
  pub cur: usize, //< advancing end of the last match
  pub pos: usize, //< VM read head
  pub end: usize, //< filled tail
  pub mrk: usize, //< candidate-start marker used by the VM

  num: u64,       //< bytes shifted out; absolute offset of buf[0]
  eof: bool,      //< the input source is exhausted

  lpb   : usize,  //< line base: newlines in [lpb..) not yet counted
  lineno: usize,  //< 1-based line of lpb
  bol   : usize,  //< begin of the line containing lpb

  tab: u8,        //< tab width for column accounting
  retain_bol: bool,
}

impl Buffer {

  pub fn new() -> Buffer {
    Buffer {
      buf: Vec::new(),
      txt: 0,
      cur: 0,
      pos: 0,
      end: 0,
      mrk: 0,
      num: 0,
      eof: false,
      lpb: 0,
      lineno: 1,
      bol: 0,
      tab: 8,
      retain_bol: true,
    }
  }

  /// Clears content and counters; capacity is kept.
  pub fn reset(&mut self) {
    self.txt = 0;
    self.cur = 0;
    self.pos = 0;
    self.end = 0;
    self.mrk = 0;
    self.num = 0;
    self.eof = false;
    self.lpb = 0;
    self.lineno = 1;
    self.bol = 0;
  }

  pub fn set_tab(&mut self, tab: u8) {
    self.tab = tab;
  }

  pub fn tab(&self) -> u8 {
    self.tab
  }

  pub fn set_retain_bol(&mut self, retain: bool) {
    self.retain_bol = retain;
  }

  pub fn at_eof(&self) -> bool {
    self.eof
  }

  pub fn set_eof(&mut self, eof: bool) {
    self.eof = eof;
  }

  /// Total bytes shifted out of the buffer so far.
  pub fn shifted(&self) -> u64 {
    self.num
  }

  /// Absolute input offset of buffer index `i`.
  pub fn offset(&self, i: usize) -> u64 {
    self.num + i as u64
  }

  pub fn contents(&self) -> &[u8] {
    &self.buf[..self.end]
  }

  pub fn byte(&self, i: usize) -> u8 {
    self.buf[i]
  }

  pub fn set_byte(&mut self, i: usize, b: u8) {
    self.buf[i] = b;
  }

  pub fn slice(&self, from: usize, to: usize) -> &[u8] {
    &self.buf[from..to]
  }

  /// Installs `data` wholesale, as `buffer(base, len)` does: contents are
  /// final and EOF is already reached.
  pub fn assign(&mut self, data: &[u8]) {
    self.reset();
    self.buf.clear();
    self.buf.extend_from_slice(data);
    self.end = data.len();
    self.eof = true;
  }

  /// Appends bytes read from `read_into`, shifting and growing as needed.
  /// Returns false at end of input. `handler` observes shifts.
  pub fn fill<F>(&mut self, read_into: F, handler: &mut Option<ShiftHandler>) -> bool
  where
    F: FnOnce(&mut [u8]) -> usize,
  {
    if self.eof {
      return false;
    }

    if self.end + BUFSZ / 4 > self.buf.len() {
      self.make_room(handler);
    }
    if self.buf.len() == self.end {
      // make_room grows when it cannot shift, so this is unreachable in
      // practice; guard anyway.
      self.buf.resize(self.end + BUFSZ, 0);
    }

    let n = read_into(&mut self.buf[self.end..]);
    if n == 0 {
      self.eof = true;
      return false;
    }
    self.end += n;
    true
  }

  /// Reclaims consumed space or grows. All cursors are rebased; `handler`
  /// is told how many bytes were discarded.
  fn make_room(&mut self, handler: &mut Option<ShiftHandler>) {
    let mut keep = self.txt.min(self.cur);

    if self.retain_bol {
      let line_start = self.line_begin(keep);
      if keep - line_start <= BOL_ABANDON {
        keep = line_start;
      }
    }

    if keep > 0 {
      if let Some(h) = handler {
        h(keep);
      }
      // Fold newlines of the discarded region into the line base.
      self.count_lines_to(keep);
      self.buf.copy_within(keep..self.end, 0);
      self.num += keep as u64;
      self.txt -= keep;
      self.cur -= keep;
      self.pos -= keep.min(self.pos);
      self.end -= keep;
      self.mrk = self.mrk.saturating_sub(keep);
      self.lpb -= keep.min(self.lpb);
      self.bol = self.bol.saturating_sub(keep);
    }

    if self.end + BUFSZ / 4 > self.buf.len() {
      let want = (self.buf.len() * 2).max(BUFSZ);
      self.buf.resize(want, 0);
    }
  }

  /// Begin of the line containing buffer index `i` (clamped to the buffer
  /// front when the line begins in shifted-out input).
  pub fn line_begin(&self, i: usize) -> usize {
    match memrchr(b'\n', &self.buf[..i]) {
      Some(nl) => nl + 1,
      None => 0,
    }
  }

  /// End of the line containing `i`, exclusive of the newline; `end` when
  /// the line is unterminated.
  pub fn line_end(&self, i: usize) -> usize {
    match memchr::memchr(b'\n', &self.buf[i..self.end]) {
      Some(nl) => i + nl,
      None => self.end,
    }
  }

  /// Advances the lazy line counter to `i`, folding newline counts into
  /// the base.
  fn count_lines_to(&mut self, i: usize) {
    if i > self.lpb {
      self.lineno += memchr_iter(b'\n', &self.buf[self.lpb..i]).count();
      if let Some(nl) = memrchr(b'\n', &self.buf[self.lpb..i]) {
        self.bol = self.lpb + nl + 1;
      }
      self.lpb = i;
    }
  }

  /// 1-based line number of buffer index `i`.
  pub fn lineno_at(&mut self, i: usize) -> usize {
    self.count_lines_to(i.min(self.end));
    if i >= self.lpb {
      self.lineno
    } else {
      // A query behind the lazy base re-counts backwards.
      self.lineno - memchr_iter(b'\n', &self.buf[i..self.lpb]).count()
    }
  }

  /// 0-based column of buffer index `i`, expanding tabs to the configured
  /// width.
  pub fn columno_at(&self, i: usize) -> usize {
    let start = self.line_begin(i);
    let tab = self.tab.max(1) as usize;
    let mut col = 0usize;
    for &b in self.buf[start..i].iter() {
      if b == b'\t' {
        col += tab - (col % tab);
      } else {
        col += 1;
      }
    }
    col
  }

  /// Leading-whitespace extent of the line containing `i`: the index just
  /// past the whitespace and its tab-expanded column width. Used by the
  /// indent metas.
  pub fn indent_info(&self, i: usize) -> (usize, usize) {
    let start = self.line_begin(i);
    let tab = self.tab.max(1) as usize;
    let mut col = 0usize;
    let mut at = start;
    for &b in self.buf[start..self.end].iter() {
      match b {
        b' '  => col += 1,
        b'\t' => col += tab - (col % tab),
        _     => break,
      }
      at += 1;
    }
    (at, col)
  }

  /// Leading-whitespace column width of the line containing `i`.
  pub fn indent_at(&self, i: usize) -> usize {
    self.indent_info(i).1
  }
}


#[cfg(test)]
mod test {
  use super::*;

  fn filled(data: &[u8]) -> Buffer {
    let mut b = Buffer::new();
    b.assign(data);
    b
  }

  #[test]
  fn assign_sets_eof() {
    let b = filled(b"abc");
    assert_eq!(b.contents(), b"abc");
    assert!(b.at_eof());
  }

  #[test]
  fn fill_appends_until_source_dries() {
    let mut b = Buffer::new();
    let mut handler: Option<ShiftHandler> = None;
    let mut chunks = vec![b"def".to_vec(), b"abc".to_vec()];
    let more = b.fill(
      |buf| {
        let c = chunks.pop().unwrap();
        buf[..c.len()].copy_from_slice(&c);
        c.len()
      },
      &mut handler,
    );
    assert!(more);
    assert_eq!(b.contents(), b"abc");
    b.fill(
      |buf| {
        let c = chunks.pop().unwrap();
        buf[..c.len()].copy_from_slice(&c);
        c.len()
      },
      &mut handler,
    );
    assert_eq!(b.contents(), b"abcdef");
    let more = b.fill(|_| 0, &mut handler);
    assert!(!more);
    assert!(b.at_eof());
  }

  #[test]
  fn line_and_column_queries() {
    let mut b = filled(b"one\ntwo\nthree");
    assert_eq!(b.lineno_at(0), 1);
    assert_eq!(b.lineno_at(4), 2);
    assert_eq!(b.lineno_at(9), 3);
    assert_eq!(b.columno_at(4), 0);
    assert_eq!(b.columno_at(6), 2);
    assert_eq!(b.line_begin(6), 4);
    assert_eq!(b.line_end(6), 7);
    // Queries behind the lazy base still answer.
    assert_eq!(b.lineno_at(0), 1);
  }

  #[test]
  fn tabs_expand_in_columns() {
    let mut b = filled(b"\tx");
    b.set_tab(8);
    assert_eq!(b.columno_at(1), 8);
    b.set_tab(4);
    assert_eq!(b.columno_at(1), 4);
  }

  #[test]
  fn indent_measures_leading_whitespace() {
    let b = filled(b"  \tcode\n");
    // Two spaces then a tab to the next stop of 8.
    assert_eq!(b.indent_at(3), 8);
  }

  #[test]
  fn shift_rebases_and_reports() {
    let mut b = Buffer::new();
    // Small capacity forces shifting on the second fill.
    b.assign(b"");
    b.set_eof(false);
    b.set_retain_bol(false);

    let mut data = vec![0u8; BUFSZ];
    for (i, d) in data.iter_mut().enumerate() {
      *d = b'a' + (i % 26) as u8;
    }
    let mut handler: Option<ShiftHandler> = None;
    let mut offset = 0usize;
    while offset < data.len() {
      let filled = b.fill(
        |buf| {
          let n = (data.len() - offset).min(buf.len()).min(1024);
          buf[..n].copy_from_slice(&data[offset..offset + n]);
          offset += n;
          n
        },
        &mut handler,
      );
      assert!(filled);
    }

    // Pretend everything so far was consumed, then force a shift.
    b.txt = b.end;
    b.cur = b.end;
    b.pos = b.end;
    let mut observed: Option<usize> = None;
    let mut shift_gap = 0usize;
    {
      let mut handler: Option<ShiftHandler> = Some(Box::new(move |gap| {
        // The closure sees the displaced byte count.
        assert!(gap > 0);
      }));
      let before = b.shifted();
      let txt_before = b.txt;
      b.fill(
        |buf| {
          buf[0] = b'!';
          1
        },
        &mut handler,
      );
      shift_gap = (b.shifted() - before) as usize;
      observed = Some(txt_before - b.txt);
    }
    assert_eq!(Some(shift_gap), observed);
    assert_eq!(b.byte(b.end - 1), b'!');
  }

  #[test]
  fn grow_preserves_contents() {
    let mut b = Buffer::new();
    let total = 3 * BUFSZ;
    let mut written = 0usize;
    let mut handler: Option<ShiftHandler> = None;
    while written < total {
      b.fill(
        |buf| {
          let n = buf.len().min(total - written).min(4096);
          for x in buf[..n].iter_mut() {
            *x = b'z';
          }
          written += n;
          n
        },
        &mut handler,
      );
    }
    // txt pinned at 0 prevents shifting, so the buffer must have grown.
    assert_eq!(b.end, total);
    assert!(b.contents().iter().all(|&x| x == b'z'));
  }
}
