/*!

  Assembles a DFA state arena into the flat 32-bit opcode table in two
  passes. Pass 1 sizes every state assuming one word per transition and
  records the offset in `State::first`. If the table cannot be addressed
  with 16-bit GOTO targets, a second sizing pass inserts LONG escape pairs
  for far targets and records the final offsets in `State::index`. The emit
  pass then writes the words:

  ```text
  [TAKE|REDO]? HEAD* TAIL* meta-GOTO* byte-GOTO* HALT?
  ```

  Byte GOTOs are sorted by `lo` and pairwise disjoint so the matcher can
  dispatch with an unrolled comparator; the trailing HALT is omitted when
  the byte edges cover all of 0..=255.

*/

use std::time::Duration;

use quanta::Clock;
use tracing::debug;

use crate::dfa::{Dfa, State};
use crate::error::{ErrorKind, RegexError, Result};
use crate::limits;
use crate::opcode::{bitmasks, opcode_goto, opcode_head, opcode_long, opcode_tail, opcode_take, Opcode};
use crate::Index32;

/// Forward targets at or above this `first` offset get a LONG pair when the
/// table overflows 16-bit addressing.
const FAR_HALF: Index32 = (bitmasks::LONG_MARKER / 2) as Index32;

pub struct Assembled {
  pub opcodes: Vec<u32>,
  pub assemble_time: Duration,
}

/// Lays out and emits the opcode table for `dfa`.
pub fn assemble(dfa: &mut Dfa) -> Result<Assembled> {
  let timer: Clock = Clock::new();
  let start_time = timer.start();

  let mut opcode_count: Index32 = 0;

  // Pass 1: size states assuming 16-bit targets everywhere.
  for state in dfa.states.iter_mut() {
    state.accept = state.accept.min(limits::ACCEPT_MAX);
    state.first = opcode_count;
    state.index = opcode_count;
    opcode_count = opcode_count
      .checked_add(words_for_state(state))
      .ok_or_else(|| RegexError::new(ErrorKind::ExceedsLimits, 0))?;
    if opcode_count > limits::GOTO_MAX_IDX {
      return Err(RegexError::new(ErrorKind::ExceedsLimits, 0));
    }
  }

  // Pass 1b: over 64K words means some GOTO targets need LONG pairs.
  let long_mode = opcode_count > bitmasks::LONG_MARKER;
  if long_mode {
    opcode_count = 0;
    for id in 0..dfa.states.len() {
      let first = dfa.states[id].first;
      dfa.states[id].index = opcode_count;
      let words = {
        let state = &dfa.states[id];
        sized_with_longs(state, first, &dfa.states)
      };
      opcode_count = opcode_count
        .checked_add(words)
        .ok_or_else(|| RegexError::new(ErrorKind::ExceedsLimits, 0))?;
      if opcode_count > limits::GOTO_MAX_IDX {
        return Err(RegexError::new(ErrorKind::ExceedsLimits, 0));
      }
    }
  }

  // Emit pass.
  let mut opcode_table: Vec<Opcode> = Vec::with_capacity(opcode_count as usize);

  for id in 0..dfa.states.len() {
    let state = &dfa.states[id];
    debug_assert_eq!(opcode_table.len() as Index32, state.index);

    if state.redo {
      opcode_table.push(Opcode::redo());
    } else if state.accept > 0 {
      opcode_table.push(opcode_take(state.accept));
    }

    for &la in state.heads.iter() {
      if la as Index32 > limits::LOOKAHEAD_MAX_IDX {
        return Err(RegexError::new(ErrorKind::ExceedsLimits, 0));
      }
      opcode_table.push(opcode_head(la as Index32));
    }
    for &la in state.tails.iter() {
      if la as Index32 > limits::LOOKAHEAD_MAX_IDX {
        return Err(RegexError::new(ErrorKind::ExceedsLimits, 0));
      }
      opcode_table.push(opcode_tail(la as Index32));
    }

    // Meta edges first, in canonical (ascending meta code) order.
    for (&lo, &(hi, target)) in state.edges.iter().filter(|(lo, _)| lo.is_meta()) {
      emit_goto(&mut opcode_table, state, &dfa.states, lo, hi, target, long_mode);
    }
    // Byte edges sorted by lo.
    for (&lo, &(hi, target)) in state.edges.iter().filter(|(lo, _)| !lo.is_meta()) {
      emit_goto(&mut opcode_table, state, &dfa.states, lo, hi, target, long_mode);
    }

    if !bytes_covered(state) {
      opcode_table.push(Opcode::halt());
    }
  }

  debug_assert_eq!(opcode_table.len() as Index32, opcode_count);

  let assemble_time = timer.delta(start_time, timer.end());
  debug!(opcodes = opcode_table.len(), long_mode, "assembly complete");

  Ok(Assembled {
    opcodes: opcode_table.into_iter().map(|op| op.0).collect(),
    assemble_time,
  })
}

/// Whether `target` needs a LONG escape pair from `state`.
fn needs_long(state_first: Index32, target: &State) -> bool {
  (target.first > state_first && target.first >= FAR_HALF)
    || target.index >= bitmasks::LONG_MARKER
}

fn emit_goto(
  opcode_table: &mut Vec<Opcode>,
  state: &State,
  states: &[State],
  lo: crate::character::Char,
  hi: crate::character::Char,
  target: crate::StateId32,
  long_mode: bool,
) {
  let target_state = &states[target as usize];
  if long_mode && needs_long(state.first, target_state) {
    opcode_table.push(opcode_goto(lo, hi, bitmasks::LONG_MARKER));
    opcode_table.push(opcode_long(target_state.index));
  } else {
    opcode_table.push(opcode_goto(lo, hi, target_state.index));
  }
}

/// Number of words `state` occupies assuming every GOTO is one word. The
/// pass-1b path uses `sized_with_longs` instead.
fn words_for_state(state: &State) -> Index32 {
  let mut words: Index32 = 0;
  if state.redo || state.accept > 0 {
    words += 1;
  }
  words += (state.heads.len() + state.tails.len()) as Index32;
  words += state.edges.len() as Index32;
  if !bytes_covered(state) {
    words += 1; // trailing HALT
  }
  words
}

/// Pass-1b sizing: like `words_for_state` but GOTOs to far targets take two
/// words.
fn sized_with_longs(state: &State, first: Index32, states: &[State]) -> Index32 {
  let mut words: Index32 = 0;
  if state.redo || state.accept > 0 {
    words += 1;
  }
  words += (state.heads.len() + state.tails.len()) as Index32;
  for (_lo, &(_hi, target)) in state.edges.iter() {
    words += match needs_long(first, &states[target as usize]) {
      true  => 2,
      false => 1,
    };
  }
  if !bytes_covered(state) {
    words += 1;
  }
  words
}

/// True when the byte edges of `state` cover every value 0..=255, making a
/// trailing HALT unreachable.
fn bytes_covered(state: &State) -> bool {
  let mut next: u32 = 0;
  for (&lo, &(hi, _)) in state.edges.iter() {
    if lo.is_meta() {
      continue;
    }
    if (lo.0 as u32) > next {
      return false;
    }
    next = next.max(hi.0 as u32 + 1);
  }
  next >= 256
}


#[cfg(test)]
mod test {
  use super::*;
  use crate::character::Char;
  use crate::dfa::Dfa;
  use crate::options::Options;
  use crate::parser::Parser;

  fn assemble_regex(regex: &str) -> Vec<u32> {
    let parsed = Parser::parse_regex(regex, &Options::default()).unwrap();
    let mut dfa = Dfa::build(&parsed).unwrap();
    assemble(&mut dfa).unwrap().opcodes
  }

  fn decode(words: &[u32]) -> Vec<Opcode> {
    words.iter().map(|&w| Opcode(w)).collect()
  }

  #[test]
  fn simple_concat_layout() {
    let ops = decode(&assemble_regex("a[b]"));
    // Start state: GOTO on 'a', HALT.
    assert!(ops[0].is_goto());
    assert_eq!(ops[0].lo(), Char::from('a'));
    assert_eq!(ops[0].hi(), Char::from('a'));
    assert!(ops[1].is_halt());
    // The 'a' target: GOTO on 'b', HALT.
    let s1 = ops[0].idx() as usize;
    assert!(ops[s1].is_goto());
    assert_eq!(ops[s1].lo(), Char::from('b'));
    // The accepting state: TAKE 1, HALT.
    let s2 = ops[s1].idx() as usize;
    assert!(ops[s2].is_take());
    assert_eq!(ops[s2].long_idx(), 1);
    assert!(ops[s2 + 1].is_halt());
  }

  #[test]
  fn accepting_state_with_loop() {
    let ops = decode(&assemble_regex("a[b]*"));
    let s1 = ops[0].idx() as usize;
    // Accepting state: TAKE then the b loop.
    assert!(ops[s1].is_take());
    assert!(ops[s1 + 1].is_goto());
    assert_eq!(ops[s1 + 1].lo(), Char::from('b'));
  }

  #[test]
  fn take_precedes_gotos() {
    let ops = decode(&assemble_regex("x"));
    // Trie path: start GOTO x, HALT; accept: TAKE, HALT.
    assert!(ops[0].is_goto());
    let s1 = ops[0].idx() as usize;
    assert!(ops[s1].is_take());
  }

  #[test]
  fn meta_edges_precede_byte_edges() {
    let ops = decode(&assemble_regex("^a|[b]"));
    // Start state: the begin-of-buffer meta GOTO comes before the byte GOTO.
    assert!(ops[0].is_meta());
    assert!(ops[1].is_goto() && !ops[1].is_meta());
  }

  #[test]
  fn full_coverage_omits_halt() {
    let parsed = Parser::parse_regex("[\\x00-\\xFF]", &Options::default()).unwrap();
    let mut dfa = Dfa::build(&parsed).unwrap();
    let ops = decode(&assemble(&mut dfa).unwrap().opcodes);
    // Start state is one catch-all GOTO word, no HALT.
    assert!(ops[0].is_goto());
    assert_eq!(ops[0].lo(), crate::character::Char(0));
    assert_eq!(ops[0].hi(), crate::character::Char(0xFF));
    let s1 = ops[0].idx() as usize;
    assert!(ops[s1].is_take());
  }

  #[test]
  fn lookahead_emits_head_and_tail() {
    let ops = decode(&assemble_regex("a(?=[b])"));
    assert!(ops.iter().any(|op| op.is_head()));
    assert!(ops.iter().any(|op| op.is_tail()));
  }

  #[test]
  fn redo_for_negative_patterns() {
    let ops = decode(&assemble_regex("(?^[a])"));
    assert!(ops.iter().any(|op| op.is_redo()));
  }

  #[test]
  fn offsets_are_consistent() {
    // Every GOTO target lands on a state boundary: a TAKE/REDO/HEAD/TAIL/
    // meta/GOTO word, never a LONG word or mid-state HALT.
    let ops = decode(&assemble_regex("(a|b)*abb"));
    let mut state_starts = vec![0usize];
    let mut i = 0;
    while i < ops.len() {
      if ops[i].is_halt() && i + 1 < ops.len() {
        state_starts.push(i + 1);
      }
      i += 1;
    }
    for op in ops.iter() {
      if !op.is_meta()
        && op.is_goto()
        && !op.is_halt()
        && op.idx() != bitmasks::HALT_MARKER
        && op.idx() != bitmasks::LONG_MARKER
      {
        // Target must begin some state.
        assert!(
          state_starts.contains(&(op.idx() as usize)),
          "target {} not on a state boundary",
          op.idx()
        );
      }
    }
  }
}
