/*!

  Subset construction from the parser's position graph into a DFA held in an
  index arena: states live in a growing vector, edges are `(lo, hi, target)`
  tuples keyed by `lo`, and state deduplication hashes position-set contents
  rather than pointers.

  Extensions over the classical algorithm:

  * lazy-quantifier filtering (`trim_lazy`) applied to every state's
    position set before canonicalization;
  * meta edges for anchors and indent boundaries, kept alongside byte
    edges in the same interval map;
  * accept priority: an accepting state takes the smallest alternative
    index among its accept positions, and negated accept positions mark
    the state `redo`;
  * lookahead head/tail id sets collected from marker positions;
  * a tree-DFA fast path that builds a trie directly when the whole
    pattern is a disjunction of fixed strings.

*/

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::debug;

use crate::character::Char;
use crate::error::{ErrorKind, RegexError, Result};
use crate::limits::MAX_DFA_STATES;
use crate::parser::{trim_lazy, Parsed};
use crate::position::PositionSet;
use crate::{Accept32, Index32, Lookahead16, StateId32};

pub type Edges = BTreeMap<Char, (Char, StateId32)>;
pub type LookaheadSet = BTreeSet<Lookahead16>;

/// One DFA state in the arena. `first` and `index` are the two-pass opcode
/// layout offsets filled in by the assembler.
#[derive(Clone, Debug, Default)]
pub struct State {
  pub positions: PositionSet,   //< the NFA subset this state represents
  pub edges    : Edges,         //< disjoint labeled intervals lo -> (hi, target)
  pub first    : Index32,       //< offset from the sizing pass
  pub index    : Index32,       //< final offset in the opcode table
  pub accept   : Accept32,      //< nonzero if final: the smallest alternative index
  pub redo     : bool,          //< true for negative-pattern acceptance
  pub heads    : LookaheadSet,  //< lookahead ids opening at this state
  pub tails    : LookaheadSet,  //< lookahead ids closing at this state
}

/// The state arena. State 0 is the start state.
#[derive(Clone, Debug, Default)]
pub struct Dfa {
  pub states: Vec<State>,
}

impl Dfa {

  pub fn start(&self) -> &State {
    &self.states[0]
  }

  pub fn len(&self) -> usize {
    self.states.len()
  }

  pub fn is_empty(&self) -> bool {
    self.states.is_empty()
  }

  /// Builds the DFA for `parsed`, choosing the trie fast path for literal
  /// disjunctions and subset construction otherwise.
  pub fn build(parsed: &Parsed) -> Result<Dfa> {
    let dfa = match parsed.all_literal {
      true  => Self::build_trie(parsed),
      false => Self::build_subsets(parsed)?,
    };
    debug!(states = dfa.len(), "dfa construction complete");
    Ok(dfa)
  }

  /// Tree-DFA: the pattern is `lit1|lit2|...`, so the DFA is the trie of
  /// the literals with accepts at their end nodes.
  fn build_trie(parsed: &Parsed) -> Dfa {
    let mut states: Vec<State> = vec![State::default()];

    for (literal, accept) in parsed.string_trie.iter() {
      let mut current: StateId32 = 0;
      for &b in literal.iter() {
        let c = Char::from(b);
        let target = match states[current as usize].edges.get(&c) {
          Some(&(_hi, target)) => target,
          None => {
            let target = states.len() as StateId32;
            states.push(State::default());
            states[current as usize].edges.insert(c, (c, target));
            target
          }
        };
        current = target;
      }
      let end = &mut states[current as usize];
      // First alternative wins on duplicate literals.
      if end.accept == 0 || *accept < end.accept {
        end.accept = *accept;
      }
    }

    Dfa { states }
  }

  /// Classical subset construction with the lazy/meta/lookahead extensions.
  fn build_subsets(parsed: &Parsed) -> Result<Dfa> {
    let mut states: Vec<State> = Vec::new();
    let mut seen: HashMap<PositionSet, StateId32> = HashMap::new();
    let mut work: VecDeque<StateId32> = VecDeque::new();

    let mut start_set = parsed.start_positions.clone();
    trim_lazy(&mut start_set);

    alloc_state(&mut states, &mut seen, &mut work, start_set, parsed)?;

    while let Some(id) = work.pop_front() {
      // Collect moves: (charset, successor positions) with overlapping
      // charsets split into disjoint intervals.
      let mut moves: Vec<(crate::chars::Chars, PositionSet)> = Vec::new();

      let positions: Vec<_> = states[id as usize].positions.iter().cloned().collect();
      for p in positions {
        if p.is_accept() {
          continue;
        }
        let cc = parsed.chars_at_position(p);
        if cc.is_empty() {
          continue; // head/tail marker positions consume nothing
        }
        let follow = parsed.follow_of(p);
        if follow.is_empty() {
          continue;
        }
        add_move(&mut moves, cc, follow);
      }

      for (cc, mut follow) in moves {
        trim_lazy(&mut follow);
        if follow.is_empty() {
          continue;
        }
        let target = match seen.get(&follow) {
          Some(&target) => target,
          None => alloc_state(&mut states, &mut seen, &mut work, follow, parsed)?,
        };

        let state = &mut states[id as usize];
        for m in cc.metas() {
          state.edges.insert(m, (m, target));
        }
        for (lo, hi) in cc.byte_ranges() {
          state.edges.insert(lo, (hi, target));
        }
      }
    }

    Ok(Dfa { states })
  }
}

/// Allocates a state for `positions`, registering accept/redo and the
/// lookahead head/tail sets from the marker positions.
fn alloc_state(
  states: &mut Vec<State>,
  seen: &mut HashMap<PositionSet, StateId32>,
  work: &mut VecDeque<StateId32>,
  positions: PositionSet,
  parsed: &Parsed,
) -> Result<StateId32> {
  if states.len() >= MAX_DFA_STATES {
    return Err(RegexError::new(ErrorKind::ExceedsLimits, 0));
  }

  let id = states.len() as StateId32;
  let mut state = State {
    positions: positions.clone(),
    ..State::default()
  };

  for p in state.positions.iter() {
    if p.is_accept() {
      match p.is_negated() {
        true => {
          state.redo = true;
        }
        false => {
          let a = p.accepts();
          if state.accept == 0 || a < state.accept {
            state.accept = a;
          }
        }
      }
    } else if p.is_ticked() {
      if let Some(&la) = parsed.tail_at.get(&p.idx()) {
        state.tails.insert(la);
      }
    } else if let Some(&la) = parsed.head_at.get(&p.idx()) {
      state.heads.insert(la);
    }
  }

  seen.insert(positions, id);
  states.push(state);
  work.push_back(id);
  Ok(id)
}

/// Adds `(cc, follow)` to the move list, splitting overlapping character
/// sets so the final intervals are pairwise disjoint. Moves with identical
/// successor sets merge their character sets.
fn add_move(
  moves: &mut Vec<(crate::chars::Chars, PositionSet)>,
  mut cc: crate::chars::Chars,
  follow: PositionSet,
) {
  let mut pending: Vec<(crate::chars::Chars, PositionSet)> = Vec::new();

  for (existing_cc, existing_follow) in moves.iter_mut() {
    if cc.is_empty() {
      break;
    }
    if !existing_cc.intersects(&cc) {
      continue;
    }
    if *existing_follow == follow {
      // Same successors: just widen the existing move.
      *existing_cc |= cc;
      cc.clear();
      break;
    }
    let overlap = *existing_cc & cc;
    *existing_cc -= overlap;
    cc -= overlap;

    let mut merged = existing_follow.clone();
    merged.extend(follow.iter());
    pending.push((overlap, merged));
  }

  moves.retain(|(c, _)| !c.is_empty());
  if !cc.is_empty() {
    moves.push((cc, follow));
  }
  for m in pending {
    // The overlap interval may itself overlap later moves.
    add_move(moves, m.0, m.1);
  }
}
