/*!
  Modifiers assign to each mode letter the set of positions in the regex at
  which that mode is active. Enable and disable ranges for the same mode are
  kept disjoint by construction: enabling adds to the range set and
  disabling subtracts from it.
*/

#![allow(non_camel_case_types)]

use ranges::GenericRange;

use crate::character::Char;
use crate::{Index32, IndexRanges};

/**
  `Mode` variants indicate which value of which mode should be set/reset. A
  capital letter means "turn off for the given range," NOT "turn off for the
  given range and on everywhere else."
*/
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Mode {
  q, Q, i, I, s, S, m, M, u, U,
}

// region `impl From`s for `Mode`

impl Mode {
  /// The mode letter for `c`, if `c` is one.
  pub fn try_from_char(c: Char) -> Option<Mode> {
    match u8::from(c) {
      b'q' => Some(Mode::q),
      b'i' => Some(Mode::i),
      b's' => Some(Mode::s),
      b'm' => Some(Mode::m),
      b'u' => Some(Mode::u),
      b'Q' => Some(Mode::Q),
      b'I' => Some(Mode::I),
      b'S' => Some(Mode::S),
      b'M' => Some(Mode::M),
      b'U' => Some(Mode::U),
      _    => None,
    }
  }
}

impl From<Mode> for u8 {
  fn from(mode: Mode) -> Self {
    match mode {
      Mode::q => b'q',
      Mode::i => b'i',
      Mode::s => b's',
      Mode::m => b'm',
      Mode::u => b'u',
      Mode::Q => b'Q',
      Mode::I => b'I',
      Mode::S => b'S',
      Mode::M => b'M',
      Mode::U => b'U',
    }
  }
}

impl From<Mode> for bool {
  fn from(mode: Mode) -> Self {
    match mode {
      Mode::q | Mode::i | Mode::s | Mode::m | Mode::u => true,
      Mode::Q | Mode::I | Mode::S | Mode::M | Mode::U => false,
    }
  }
}

// endregion

/**
  Modifiers in this struct are those for which different parts of the regex
  may have different modes enabled: `i` (case insensitive), `m` (multiline
  anchors), `q` (verbatim quoting), `s` (dotall), `u` (Unicode classes).
  Global-only flags such as free-spacing live on `Options`.
*/
#[derive(Clone, Eq, PartialEq, Default, Debug)]
pub struct Modifiers {
  q_x_quotes         : IndexRanges, //< "X" quotation of verbatim content, `(?q:X)`
  i_case_insensitive : IndexRanges, //< Case insensitive mode, `(?i:X)`
  s_single_line      : IndexRanges, //< Single-line (dotall) mode, `(?s:X)`
  m_multiline        : IndexRanges, //< Multi-line anchor mode, `(?m:X)`
  u_unicode          : IndexRanges, //< Unicode class mode, `(?u:X)`
}

impl Modifiers {

  /// Sets the mode for the given range of regex offsets.
  pub fn set<R>(&mut self, mode: Mode, range: R)
  where
    R: Into<GenericRange<Index32>>,
  {
    let ranges = self.get_from_mode_mut(mode);
    match bool::from(mode) {
      true  => {
        *ranges += range.into();
      }
      false => {
        *ranges -= range.into();
      }
    }
  }

  /// Reports whether `index` is a position at which modifier `mode` is
  /// active.
  pub fn is_set(&self, index: Index32, mode: Mode) -> bool {
    self.get_from_mode(mode).contains(&index)
  }

  fn get_from_mode_mut(&mut self, mode: Mode) -> &mut IndexRanges {
    match mode {
      Mode::q | Mode::Q => &mut self.q_x_quotes,
      Mode::i | Mode::I => &mut self.i_case_insensitive,
      Mode::s | Mode::S => &mut self.s_single_line,
      Mode::m | Mode::M => &mut self.m_multiline,
      Mode::u | Mode::U => &mut self.u_unicode,
    }
  }

  fn get_from_mode(&self, mode: Mode) -> &IndexRanges {
    match mode {
      Mode::q | Mode::Q => &self.q_x_quotes,
      Mode::i | Mode::I => &self.i_case_insensitive,
      Mode::s | Mode::S => &self.s_single_line,
      Mode::m | Mode::M => &self.m_multiline,
      Mode::u | Mode::U => &self.u_unicode,
    }
  }
}


#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn set_and_query() {
    let mut mods = Modifiers::default();
    mods.set(Mode::i, 2..10);
    assert!(mods.is_set(2, Mode::i));
    assert!(mods.is_set(9, Mode::i));
    assert!(!mods.is_set(10, Mode::i));
    assert!(!mods.is_set(0, Mode::i));
  }

  #[test]
  fn disable_subtracts() {
    let mut mods = Modifiers::default();
    mods.set(Mode::m, 0..20);
    mods.set(Mode::M, 5..10);
    assert!(mods.is_set(4, Mode::m));
    assert!(!mods.is_set(5, Mode::m));
    assert!(!mods.is_set(9, Mode::m));
    assert!(mods.is_set(10, Mode::m));
  }

  #[test]
  fn modes_are_independent() {
    let mut mods = Modifiers::default();
    mods.set(Mode::i, 0..4);
    mods.set(Mode::s, 2..6);
    assert!(mods.is_set(1, Mode::i));
    assert!(!mods.is_set(1, Mode::s));
    assert!(mods.is_set(5, Mode::s));
    assert!(!mods.is_set(5, Mode::i));
  }
}
