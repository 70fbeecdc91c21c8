/*!

  Parses a regular expression string into the position graph consumed by the
  DFA builder: a `firstpos` set for the whole pattern, a `followpos` map
  linking every leaf position to its successors, lazy-quantifier tags,
  modifier ranges, and the lookahead head/tail index maps.

  The parser walks the string through four mutually recursive productions:

  ```text
  parse -> parse_anchors -> parse_iterated -> parse_sequence
             ^                                      |
             +---------- parse_alternations <-------+
  ```

  `parse` handles the top-level alternation and assigns 1-based accept
  indices in source order; `parse_anchors` handles concatenation and the
  begin/end anchor context; `parse_iterated` handles `* + ? {n,m}` and their
  lazy forms; `parse_sequence` parses a single atom.

*/

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use defaultmap::DefaultHashMap;
use patricia_tree::PatriciaMap;
use quanta::Clock;
use tracing::debug;

use crate::character::{Char, Meta};
use crate::chars::{self, Chars};
use crate::error::{ErrorKind, RegexError, Result};
use crate::limits::{MAX_INDEX, MAX_ITER};
use crate::modifier::{Mode, Modifiers};
use crate::options::Options;
use crate::position::{Position, PositionSet};
use crate::{Accept32, FollowMap, Index32, Iteration16, Lazy8, LazySet, Lookahead16};

static END_ESCAPE_OPTION: &[u8; 39] = b"0123456789<>ABDHLNPSUWXbcdehijklpsuwxz\0";
static META_OPS         : &[u8; 10] = b".^$([{?*+\"";

/// Deepest `{name}` macro substitution nesting accepted before giving up.
const MACRO_DEPTH_MAX: usize = 8;

/// One subexpression's worth of position bookkeeping, threaded through the
/// recursive productions.
#[derive(Default, Clone)]
pub(crate) struct Group {
  pub first_positions: PositionSet, //< Positions at which the first match char can occur
  pub last_positions : PositionSet, //< Positions at which the group match can end
  pub lazy_set       : LazySet,     //< Lazy quantifier ids introduced inside the group
  pub nullable       : bool,        //< Can this group match the empty string?
  pub iteration      : Iteration16, //< Position-copy multiplicity from bounded repeats
}

/// The parser's product: everything the DFA builder needs.
#[derive(Debug)]
pub struct Parsed {
  pub regex          : String,
  pub start_positions: PositionSet,
  pub follow_map     : FollowMap,
  pub modifiers      : Modifiers,

  /// Character set of every consuming or anchor atom, keyed by regex offset.
  pub chars_at: HashMap<Index32, Chars>,
  /// Offsets parsed as `.`, which admit `\n` only under `s` mode.
  pub dot_positions: HashSet<Index32>,

  /// Lookahead `(` offsets to flat left-to-right lookahead ids.
  pub head_at: HashMap<Index32, Lookahead16>,
  /// Lookahead `)` offsets to the same ids.
  pub tail_at: HashMap<Index32, Lookahead16>,
  /// `(head offset, tail offset)` per lookahead id.
  pub lookaheads: Vec<(Index32, Index32)>,

  /// Literal alternatives when the whole pattern is a disjunction of fixed
  /// strings; drives the tree-DFA fast path and the multi-needle prefilter.
  pub string_trie: PatriciaMap<Accept32>,
  pub all_literal: bool,

  pub accept_count: Accept32,
  pub parse_time  : Duration,
}

impl Parsed {

  /// The character set of the atom at position `p` under the modifier regime
  /// in effect at `p`'s source location.
  pub fn chars_at_position(&self, p: Position) -> Chars {
    let idx = p.idx();
    let mut cc = match self.chars_at.get(&idx) {
      Some(cc) => *cc,
      None => return Chars::new(), // marker positions have no character set
    };
    if self.dot_positions.contains(&idx) && self.modifiers.is_set(idx, Mode::s) {
      cc.insert('\n'.into());
    }
    if self.modifiers.is_set(idx, Mode::i) {
      cc.make_case_insensitive();
    }
    // Without multiline mode the line anchors bind to the buffer instead.
    if !self.modifiers.is_set(idx, Mode::m) {
      if cc.contains(Meta::BeginningOfLine) {
        cc.remove(Meta::BeginningOfLine);
        cc.insert(Meta::BeginningOfBuffer);
      }
      if cc.contains(Meta::EndOfLine) {
        cc.remove(Meta::EndOfLine);
        cc.insert(Meta::EndOfBuffer);
      }
    }
    cc
  }

  /// Successors of position `p`, or an empty set.
  pub fn follow_of(&self, p: Position) -> PositionSet {
    self.follow_map.get(p.index_with_iter()).clone()
  }
}

pub struct Parser<'a> {
  idx      : Index32,   //< Cursor into `self.regex`
  regex    : &'a [u8],  //< Regular expression string as bytes, post macro expansion
  options  : Options,   //< Pattern compiler options
  modifiers: Modifiers, //< Which modifiers are active at which positions

  at_begin      : bool,   //< No consuming atom parsed yet in the current alternative
  lazy_count    : Lazy8,  //< Running lazy quantifier id
  lazy_set      : LazySet,

  follow_map     : FollowMap,
  start_positions: PositionSet,

  head_at   : HashMap<Index32, Lookahead16>,
  tail_at   : HashMap<Index32, Lookahead16>,
  lookaheads: Vec<(Index32, Index32)>,

  chars_at     : HashMap<Index32, Chars>,
  dot_positions: HashSet<Index32>,
}

impl<'a> Parser<'a> {

  /// Expands `{name}` macros, then parses `regex` under `options`.
  pub fn parse_regex(regex: &str, options: &Options) -> Result<Parsed> {
    let expanded = expand_macros(regex, &options.macros, 0)?;

    let mut parser = Parser {
      idx: 0,
      regex: expanded.as_bytes(),
      options: options.clone(),
      modifiers: Modifiers::default(),
      at_begin: true,
      lazy_count: 0,
      lazy_set: LazySet::default(),
      follow_map: DefaultHashMap::new(PositionSet::default()),
      start_positions: PositionSet::default(),
      head_at: HashMap::new(),
      tail_at: HashMap::new(),
      lookaheads: Vec::new(),
      chars_at: HashMap::new(),
      dot_positions: HashSet::new(),
    };

    let timer: Clock = Clock::new();
    let parse_start_time = timer.start();

    let (accept_count, string_trie, all_literal) = parser.parse()?;

    let parse_time = timer.delta(parse_start_time, timer.end());
    debug!(
      alternatives = accept_count,
      atoms = parser.chars_at.len(),
      literal = all_literal,
      "parse complete"
    );

    // Destructuring ends the parser's borrow of the expanded regex text.
    let Parser {
      start_positions,
      follow_map,
      modifiers,
      chars_at,
      dot_positions,
      head_at,
      tail_at,
      lookaheads,
      ..
    } = parser;

    Ok(Parsed {
      regex: expanded,
      start_positions,
      follow_map,
      modifiers,
      chars_at,
      dot_positions,
      head_at,
      tail_at,
      lookaheads,
      string_trie,
      all_literal,
      accept_count,
      parse_time,
    })
  }

  // region Inlined cursor methods

  /// Returns the character at index `idx` of the regular expression, or NUL
  /// past the end.
  #[must_use]
  fn at(&self, idx: Index32) -> Char {
    if idx >= self.regex.len() as Index32 {
      return '\0'.into();
    }
    Char::from(self.regex[idx as usize])
  }

  /// Same as `at()` but assumes `idx == self.idx`.
  #[must_use]
  fn c(&self) -> Char {
    self.at(self.idx)
  }

  /// Same as `c()` but PRE-increments `self.idx`.
  #[must_use]
  fn cr(&mut self) -> Char {
    self.idx += 1;
    self.at(self.idx)
  }

  #[must_use]
  fn escape_at(&self, loc: Index32) -> Option<Char> {
    if self.at(loc) == self.options.escape_character {
      return Some(self.at(loc + 1));
    }
    None
  }

  fn err<T>(&self, kind: ErrorKind) -> Result<T> {
    Err(RegexError::new(kind, self.idx))
  }

  fn err_at<T>(&self, kind: ErrorKind, idx: Index32) -> Result<T> {
    Err(RegexError::new(kind, idx))
  }

  fn follow_insert(&mut self, from: Position, to: Position) {
    self.follow_map.get_mut(from.index_with_iter()).insert(to);
  }

  fn follow_extend(&mut self, from: Position, to: &PositionSet) {
    self
      .follow_map
      .get_mut(from.index_with_iter())
      .extend(to.iter());
  }

  fn next_lazy_id(&mut self) -> Result<Lazy8> {
    match self.lazy_count.checked_add(1) {
      Some(n) => {
        self.lazy_count = n;
        Ok(n)
      }
      // overflow: exceeds max 255 lazy quantifiers
      None => self.err(ErrorKind::ExceedsLimits),
    }
  }

  // endregion

  /**
  ## Stage 0
  Top-level parse: global `(?imsux-imsux)` modifiers, the literal-disjunction
  fast path, then one accept index per `|`-alternative.
  */
  fn parse(&mut self) -> Result<(Accept32, PatriciaMap<Accept32>, bool)> {
    let len: Index32 = self.regex.len() as Index32;

    if len == 0 {
      return self.err(ErrorKind::EmptyExpression);
    }
    if len > MAX_INDEX - 0x100 {
      return self.err(ErrorKind::ExceedsLength);
    }

    self.parse_global_modifiers()?;

    // Literal-disjunction fast path: when every alternative is a plain
    // string the whole pattern compiles to a trie without a position graph.
    let mut string_trie = PatriciaMap::new();
    if !self.options.insensitive_case && !self.options.x_freespacing && !self.options.quote_with_x {
      if let Some(literals) = self.scan_literal_alternatives() {
        let mut accept: Accept32 = 0;
        for literal in literals {
          accept += 1;
          if string_trie.get(&literal).is_none() {
            string_trie.insert(&literal, accept);
          }
        }
        self.apply_global_modes(len);
        return Ok((accept, string_trie, true));
      }
    }

    let mut accept_count: Accept32 = 0;
    loop {
      accept_count += 1;
      if accept_count > crate::limits::ACCEPT_MAX {
        return self.err(ErrorKind::ExceedsLimits);
      }
      self.at_begin = true;
      self.lazy_set.clear();

      let mut group = Group::default();
      self.parse_anchors(&mut group)?;

      // Terminate the alternative with its accept position.
      let accept_position = Position(accept_count as u64).set_accept(true);
      let lazy_accepts = lazify_with(&self.lazy_set, accept_position);
      for p in group.last_positions.iter().cloned().collect::<Vec<_>>() {
        for a in lazy_accepts.iter() {
          self.follow_insert(p, *a);
        }
      }
      self.start_positions.extend(group.first_positions.iter());
      if group.nullable {
        self.start_positions.extend(lazy_accepts.iter());
      }

      if self.c() != '|' {
        break;
      }
      self.idx += 1;
    }

    if self.c() != '\0' {
      // Unconsumed input can only be an unbalanced closer.
      return match u8::from(self.c()) {
        b')' => self.err(ErrorKind::MismatchedParens),
        b'}' => self.err(ErrorKind::MismatchedBraces),
        b']' => self.err(ErrorKind::MismatchedBrackets),
        _    => self.err(ErrorKind::InvalidSyntax),
      };
    }

    self.apply_global_modes(len);

    Ok((accept_count, string_trie, false))
  }

  fn apply_global_modes(&mut self, len: Index32) {
    if self.options.insensitive_case {
      self.modifiers.set(Mode::i, 0..len);
    }
    if self.options.multiline {
      self.modifiers.set(Mode::m, 0..len);
    }
    if self.options.single_line {
      self.modifiers.set(Mode::s, 0..len);
    }
    if self.options.unicode {
      self.modifiers.set(Mode::u, 0..len);
    }
  }

  /**
  ## Stage 0B
  Parse "multiple modifiers mode," e.g. `(?imsux-imsux)`, where the mode
  letters before the dash are enabled and those after it are disabled.
  */
  fn parse_global_modifiers(&mut self) -> Result<()> {
    if self.c() == '(' && self.at(1) == '?' {
      self.idx = 2;

      // Compute the ending location of the option expression.
      while self.c().is_alphanumeric() || self.c() == '-' {
        self.idx += 1;
      }

      if self.c() == ')' && self.idx > 2 {
        let end = self.idx;
        let mut active: bool = true;
        self.idx = 2;

        while self.idx < end {
          match u8::from(self.c()) {
            b'-' => active = false,
            b'i' => self.options.insensitive_case = active,
            b'm' => self.options.multiline = active,
            b'q' => self.options.quote_with_x = active,
            b's' => self.options.single_line = active,
            b'u' => self.options.unicode = active,
            b'x' => self.options.x_freespacing = active,
            _ => {
              return self.err(ErrorKind::InvalidModifier);
            }
          }
          self.idx += 1;
        }
        // Skip the ')'
        self.idx += 1;
      } else {
        // `(?...)` contains more than just options; reinterpret the
        // expression as a match group.
        self.idx = 0;
      }
    }
    Ok(())
  }

  /// When the whole pattern is `lit1|lit2|...` with only trivial escapes,
  /// returns the unescaped literals in source order.
  fn scan_literal_alternatives(&self) -> Option<Vec<Vec<u8>>> {
    let mut literals: Vec<Vec<u8>> = Vec::new();
    let mut literal: Vec<u8> = Vec::new();
    let mut i: Index32 = self.idx;

    loop {
      let c = self.at(i);
      if c == '\0' || c == '|' {
        if literal.is_empty() {
          return None; // empty alternative: graph path handles nullability
        }
        literals.push(std::mem::take(&mut literal));
        if c == '\0' {
          break;
        }
        i += 1;
        continue;
      }
      if META_OPS.contains(&c.into()) || c == ']' || c == '}' || c == ')' {
        return None;
      }
      if c == self.options.escape_character {
        let e = self.at(i + 1);
        if END_ESCAPE_OPTION.contains(&e.into()) || e == '\0' {
          return None; // class/anchor escapes need the position graph
        }
        literal.push(match Char::try_from_escape(e) {
          Some(descaped) => descaped.into(),
          None => e.into(),
        });
        i += 2;
        continue;
      }
      literal.push(c.into());
      i += 1;
    }

    match literals.is_empty() {
      true  => None,
      false => Some(literals),
    }
  }

  /**
  ## Stage 1
  Parses alternations inside a group.
  */
  fn parse_alternations(&mut self, group: &mut Group) -> Result<()> {
    self.parse_anchors(group)?;

    while self.c() == '|' {
      self.idx += 1;

      let mut new_group = Group::default();
      self.parse_anchors(&mut new_group)?;

      group.first_positions.extend(new_group.first_positions.iter());
      group.last_positions.extend(new_group.last_positions.iter());
      group.lazy_set.extend(new_group.lazy_set.iter());
      group.nullable = new_group.nullable || group.nullable;
      group.iteration = group.iteration.max(new_group.iteration);
    }
    Ok(())
  }

  /**
  ## Stage 2
  Parses a concatenation of quantified atoms. Anchor context (`at_begin`)
  flips to "end" once the concatenation has consumed an atom, which selects
  between the begin-word and end-word meta variants.
  */
  fn parse_anchors(&mut self, group: &mut Group) -> Result<()> {
    self.parse_iterated(group)?;

    loop {
      let c = self.c();
      if c == '\0' || c == '|' || c == ')' {
        break;
      }

      let mut new_group = Group::default();
      self.parse_iterated(&mut new_group)?;

      // Concatenate group . new_group.
      if !group.lazy_set.is_empty() {
        // An outer lazy quantifier taints the continuation too.
        new_group.first_positions = lazify_set(&group.lazy_set, &new_group.first_positions);
      }

      for p in group.last_positions.iter().cloned().collect::<Vec<_>>() {
        self.follow_extend(p, &new_group.first_positions);
      }

      if group.nullable {
        group.first_positions.extend(new_group.first_positions.iter());
      }
      if new_group.nullable {
        group.last_positions.extend(new_group.last_positions.iter());
      } else {
        group.last_positions = new_group.last_positions;
      }

      group.lazy_set.extend(new_group.lazy_set.iter());
      group.nullable = group.nullable && new_group.nullable;
      group.iteration = group.iteration.max(new_group.iteration);
    }
    Ok(())
  }

  /**
  ## Stage 3
  Parses repeated/optional subexpressions: `*`, `+`, `?`, `{n,m}`, and their
  lazy `?`-suffixed forms.
  */
  fn parse_iterated(&mut self, group: &mut Group) -> Result<()> {
    let original_idx: Index32 = self.idx;

    self.parse_sequence(group)?;

    loop {
      let c = self.c();

      if c == '*' || c == '+' || c == '?' {
        if self.idx == original_idx {
          // Quantifier with nothing to quantify.
          return self.err(ErrorKind::InvalidQuantifier);
        }
        if c == '*' || c == '?' {
          group.nullable = true;
        }
        self.idx += 1;

        if self.c() == '?' {
          // Lazy quantifier.
          let lazy_id = self.next_lazy_id()?;
          group.lazy_set.insert(lazy_id);
          self.lazy_set.insert(lazy_id);
          if group.nullable {
            group.first_positions = lazify_set(&group.lazy_set, &group.first_positions);
          }
          self.idx += 1;
        } else {
          group.first_positions = greedify(&group.first_positions);
        }

        if c == '+' && !group.nullable && !group.lazy_set.is_empty() {
          let more_first = lazify_set(&group.lazy_set, &group.first_positions);
          for p in group.last_positions.iter().cloned().collect::<Vec<_>>() {
            self.follow_extend(p, &more_first);
          }
          group.first_positions.extend(more_first.iter());
        } else if c == '*' || c == '+' {
          let first = group.first_positions.clone();
          for p in group.last_positions.iter().cloned().collect::<Vec<_>>() {
            self.follow_extend(p, &first);
          }
        }
      } else if c == '{' && self.at(self.idx + 1).is_digit() {
        // {n,m}: repeat at least n times, at most m.
        self.idx += 1;
        let brace_idx = self.idx;
        let k = self.parse_digit();
        if k > MAX_ITER as usize {
          return self.err(ErrorKind::ExceedsLimits);
        }

        let n: Iteration16 = k as Iteration16;
        let mut m: Iteration16 = n;
        let mut unlimited: bool = false;

        if self.c() == ',' {
          self.idx += 1;
          if self.c().is_digit() {
            let k = self.parse_digit();
            if k > MAX_ITER as usize {
              return self.err(ErrorKind::ExceedsLimits);
            }
            m = k as Iteration16;
          } else {
            unlimited = true;
          }
        }

        if self.c() != '}' {
          return self.err_at(ErrorKind::MismatchedBraces, brace_idx);
        }
        if n > m {
          return self.err(ErrorKind::InvalidRepeat);
        }
        if brace_idx == original_idx + 1 {
          return self.err(ErrorKind::InvalidQuantifier);
        }
        self.idx += 1;

        let old_nullable: bool = group.nullable;
        if n == 0 {
          group.nullable = true;
        }

        if self.c() == '?' {
          let lazy_id = self.next_lazy_id()?;
          group.lazy_set.insert(lazy_id);
          self.lazy_set.insert(lazy_id);
          if group.nullable {
            group.first_positions = lazify_set(&group.lazy_set, &group.first_positions);
          }
          self.idx += 1;
        } else if n < m && group.lazy_set.is_empty() {
          group.first_positions = greedify(&group.first_positions);
        }

        if group.nullable && unlimited {
          // {0,} == *
          let first = group.first_positions.clone();
          for p in group.last_positions.iter().cloned().collect::<Vec<_>>() {
            self.follow_extend(p, &first);
          }
        } else if m > 0 {
          if group.iteration.checked_mul(m).is_none() {
            return self.err(ErrorKind::ExceedsLimits);
          }

          // Update the follow map by virtually repeating the sub-regex m-1
          // times, distinguishing copies by the iteration counter.
          let mut more_follow: Vec<(Position, PositionSet)> = Vec::new();
          for (position, positions_set) in self.follow_map.iter() {
            if position.idx() >= original_idx {
              for i in 0..m.saturating_sub(1) {
                let shift = group.iteration * (i + 1);
                let copied: PositionSet =
                  positions_set.iter().map(|p| p.increment_iter(shift)).collect();
                more_follow.push((position.increment_iter(shift), copied));
              }
            }
          }
          for (position, positions_set) in more_follow {
            self
              .follow_map
              .get_mut(position.index_with_iter())
              .extend(positions_set.iter());
          }

          // Add m-1 virtual concatenations (by indexed positions k.i).
          for i in 0..m.saturating_sub(1) {
            for k in group.last_positions.iter().cloned().collect::<Vec<_>>() {
              let copied_first: PositionSet = group
                .first_positions
                .iter()
                .map(|j| j.increment_iter(group.iteration * (i + 1)))
                .collect();
              self.follow_extend(k.increment_iter(group.iteration * i), &copied_first);
            }
          }
          if unlimited {
            for k in group.last_positions.iter().cloned().collect::<Vec<_>>() {
              let copied_first: PositionSet = group
                .first_positions
                .iter()
                .map(|j| j.increment_iter(group.iteration * (m - 1)))
                .collect();
              self.follow_extend(k.increment_iter(group.iteration * (m - 1)), &copied_first);
            }
          }
          if old_nullable {
            // Extend first positions when the sub-regex is nullable.
            let mut more_first = PositionSet::new();
            for i in 1..m {
              for k in group.first_positions.iter() {
                more_first.insert(k.increment_iter(group.iteration * i));
              }
            }
            group.first_positions.extend(more_first.iter());
          }
          {
            // Copies n-1 to m-1 may end the match; all copies when nullable.
            let mut new_last = PositionSet::new();
            let start_copy = if group.nullable { 0 } else { n - 1 };
            for i in start_copy..m {
              for k in group.last_positions.iter() {
                new_last.insert(k.increment_iter(group.iteration * i));
              }
            }
            group.last_positions = new_last;
          }
          group.iteration *= m;
        } else {
          // Zero range {0}: the subexpression vanishes.
          group.first_positions.clear();
          group.last_positions.clear();
          group.lazy_set.clear();
        }
      } else {
        break;
      }
    }
    Ok(())
  }

  fn parse_digit(&mut self) -> usize {
    let mut k: usize = 0;
    for _i in 0..7 {
      let c = self.c();
      if !c.is_digit() {
        break;
      }
      k = 10 * k + (u8::from(c) - b'0') as usize;
      self.idx += 1;
    }
    k
  }

  /**
  ## Stage 4
  Parses a single atom: a group, a bracket class, a quotation, an anchor, an
  escape, or a plain character.
  */
  fn parse_sequence(&mut self, group: &mut Group) -> Result<()> {
    group.first_positions.clear();
    group.last_positions.clear();
    group.lazy_set.clear();
    group.nullable = true;
    group.iteration = 1;

    if self.options.x_freespacing {
      loop {
        let c = self.c();
        if c.is_whitespace() {
          self.idx += 1;
        } else if c == '#' {
          // Comment runs to end of line (or end of pattern).
          while self.c() != '\0' && self.c() != '\n' {
            self.idx += 1;
          }
        } else {
          break;
        }
      }
    }

    let c: Char = self.c();

    if c == '(' {
      self.parse_group(group)?;
    } else if c == '[' {
      self.parse_bracket_class(group)?;
    } else if (c == '"' && self.options.quote_with_x) || self.escape_at(self.idx) == Some('Q'.into()) {
      self.parse_quoted(group)?;
    } else if c == '.' {
      let pos_idx = self.idx;
      let mut cc = Chars::all_bytes();
      cc.remove('\n'.into());
      self.chars_at.insert(pos_idx, cc);
      self.dot_positions.insert(pos_idx);
      self.make_leaf(group, pos_idx);
      self.idx += 1;
    } else if c == '^' {
      self.make_anchor_leaf(group, {
        let mut cc = Chars::new();
        cc.insert(Meta::BeginningOfLine);
        cc
      });
      self.idx += 1;
    } else if c == '$' {
      self.make_anchor_leaf(group, {
        let mut cc = Chars::new();
        cc.insert(Meta::EndOfLine);
        cc
      });
      self.idx += 1;
    } else if c == self.options.escape_character {
      self.parse_escaped_atom(group)?;
    } else if c == ')' {
      return self.err(ErrorKind::MismatchedParens);
    } else if c == '}' {
      return self.err(ErrorKind::MismatchedBraces);
    } else if c == ']' {
      return self.err(ErrorKind::MismatchedBrackets);
    } else if c == '{' {
      // A brace here is neither a repeat (those follow an atom) nor a macro
      // (those were expanded before parsing).
      return match self.at(self.idx + 1).is_alphabetic() {
        true  => self.err(ErrorKind::UndefinedName),
        false => self.err(ErrorKind::MismatchedBraces),
      };
    } else if c != '\0' && c != '|' && c != '?' && c != '*' && c != '+' {
      // Plain character.
      let pos_idx = self.idx;
      let mut cc = Chars::new();
      cc.insert(c);
      self.chars_at.insert(pos_idx, cc);
      self.make_leaf(group, pos_idx);
      self.idx += 1;
    }
    // Otherwise the atom is empty: a bare `|`, `)` boundary, or pattern end.
    // Empty subpatterns are nullable groups with no positions.

    Ok(())
  }

  /// Installs a consuming leaf at `pos_idx` into `group`.
  fn make_leaf(&mut self, group: &mut Group, pos_idx: Index32) {
    group.first_positions.insert(pos_idx.into());
    group.last_positions.insert(pos_idx.into());
    group.nullable = false;
    self.at_begin = false;
  }

  /// Installs an anchor leaf with the given meta set at the current index.
  fn make_anchor_leaf(&mut self, group: &mut Group, metas: Chars) {
    let pos_idx = self.idx;
    self.chars_at.insert(pos_idx, metas);
    group.first_positions.insert(Position(pos_idx as u64).set_anchor(true));
    group.last_positions.insert(Position(pos_idx as u64).set_anchor(true));
    group.nullable = false;
    // Anchors do not consume input, so the begin context is preserved.
  }

  /// Parses `(...)` group forms.
  fn parse_group(&mut self, group: &mut Group) -> Result<()> {
    let open_idx = self.idx;
    self.idx += 1;

    if self.c() == '?' {
      let c = self.cr();

      if c == '#' {
        // (?# comment )
        match self.regex[self.idx as usize..].iter().position(|&x| x == b')') {
          Some(offset) => {
            self.idx += offset as Index32 + 1;
          }
          None => {
            return self.err_at(ErrorKind::MismatchedParens, open_idx);
          }
        }
        return Ok(());
      } else if c == '^' {
        // (?^ negative pattern: matched, then ignored.
        self.idx += 1;
        self.parse_alternations(group)?;
        let redo_position = Position(0).set_accept(true).set_negate(true);
        for p in group.last_positions.iter().cloned().collect::<Vec<_>>() {
          self.follow_insert(p, redo_position);
        }
      } else if c == '=' {
        // (?= lookahead
        let lookahead_start: Position = Position((self.idx - 2) as u64); // at the `(`
        if self.lookaheads.len() >= Lookahead16::MAX as usize {
          return self.err(ErrorKind::ExceedsLimits);
        }
        let la: Lookahead16 = self.lookaheads.len() as Lookahead16;
        self.idx += 1;

        self.parse_alternations(group)?;

        self.head_at.insert(lookahead_start.idx(), la);
        group.first_positions.insert(lookahead_start);

        // The stop marker rides at the `)` offset.
        let stop_idx = self.idx;
        let ticked = Position(stop_idx as u64).set_ticked(true);
        self.tail_at.insert(stop_idx, la);
        self.lookaheads.push((lookahead_start.idx(), stop_idx));

        for p in group.last_positions.iter().cloned().collect::<Vec<_>>() {
          self.follow_insert(p, ticked);
        }
        group.last_positions.insert(ticked);
        if group.nullable {
          group.first_positions.insert(ticked);
          group.last_positions.insert(lookahead_start);
        }
      } else if c == ':' {
        self.idx += 1;
        self.parse_alternations(group)?;
      } else {
        // Scoped modifiers (?imsuxq-imsuxq: ... ) or (?imsuxq-imsuxq)
        let modifier_start: Index32 = self.idx;

        // Store original x/q options, as a recursive call could change them.
        let opt_q: bool = self.options.quote_with_x;
        let opt_x: bool = self.options.x_freespacing;
        let mut active: bool = true;

        let mut c = self.c();
        loop {
          if c == '-' {
            active = false;
          } else if c == 'q' {
            self.options.quote_with_x = active;
          } else if c == 'x' {
            self.options.x_freespacing = active;
          } else if c != 'i' && c != 'm' && c != 's' && c != 'u' {
            return self.err(ErrorKind::InvalidModifier);
          }

          c = self.cr();
          if c == '\0' || c == ':' || c == ')' {
            break;
          }
        }

        if c == '\0' {
          return self.err_at(ErrorKind::MismatchedParens, open_idx);
        }
        self.idx += 1;

        // A mode-only group `(?i)` scopes to the rest of the pattern; a
        // `(?i:...)` group scopes to its body.
        let body_end = match c == ':' {
          true => {
            self.parse_alternations(group)?;
            self.idx
          }
          false => self.regex.len() as Index32,
        };

        // Record the modifier ranges now that the body span is known.
        active = true;
        let mut mi = modifier_start;
        loop {
          let letter = self.at(mi);
          mi += 1;
          if letter == '-' {
            active = false;
          } else if letter == '\0' || letter == ':' || letter == ')' {
            break;
          } else if letter != 'q' && letter != 'x' {
            let mode_letter = match active {
              true  => letter,
              false => letter.to_uppercase(),
            };
            if let Some(mode) = Mode::try_from_char(mode_letter) {
              self.modifiers.set(mode, mi..body_end);
            }
          }
        }

        if c == ')' {
          // Mode-only group: q/x stay in effect for the rest of the
          // pattern.
          return Ok(());
        }
        // Restore x/q, which scope to the group body.
        self.options.quote_with_x = opt_q;
        self.options.x_freespacing = opt_x;
      }
    } else {
      self.parse_alternations(group)?;
    }

    if self.c() != ')' {
      return self.err_at(ErrorKind::MismatchedParens, open_idx);
    }
    self.idx += 1;
    Ok(())
  }

  /// Parses a bracket expression `[...]` with POSIX classes, ranges, and
  /// `&&`/`--` set operations, producing one consuming leaf.
  fn parse_bracket_class(&mut self, group: &mut Group) -> Result<()> {
    let pos_idx = self.idx;
    let cc = self.parse_bracket_chars()?;

    if !cc.has_bytes() {
      return self.err_at(ErrorKind::EmptyClass, pos_idx);
    }

    self.chars_at.insert(pos_idx, cc);
    self.make_leaf(group, pos_idx);
    Ok(())
  }

  /// Parses the interior of a bracket expression starting at `[` and leaves
  /// the cursor one past the closing `]`.
  fn parse_bracket_chars(&mut self) -> Result<Chars> {
    let open_idx = self.idx;
    let mut cc = Chars::new();
    let mut negate = false;

    let mut c = self.cr(); // step over '['
    if c == '^' {
      negate = true;
      c = self.cr();
    }

    let mut first_element = true;
    let mut prev: Option<Char> = None; // range candidate

    while c != '\0' {
      if c == ']' && !first_element {
        break;
      }
      first_element = false;

      if c == '[' && self.at(self.idx + 1) == ':' {
        // POSIX class [:name:]
        let name_start = self.idx + 2;
        let mut name_end = name_start;
        while self.at(name_end).is_alphabetic() {
          name_end += 1;
        }
        if self.at(name_end) != ':' || self.at(name_end + 1) != ']' {
          return self.err_at(ErrorKind::InvalidClass, self.idx);
        }
        let name = std::str::from_utf8(&self.regex[name_start as usize..name_end as usize])
          .map_err(|_| RegexError::new(ErrorKind::InvalidClass, self.idx))?;
        match chars::find_posix_class_by_name(name) {
          Some(class) => cc |= *class,
          None => return self.err_at(ErrorKind::InvalidClass, name_start),
        }
        prev = None;
        self.idx = name_end + 2;
      } else if c == '[' && (self.at(self.idx + 1) == '.' || self.at(self.idx + 1) == '=') {
        // Collating elements [[.x.]] and equivalence classes [[=x=]].
        return self.err(ErrorKind::InvalidCollating);
      } else if (c == '&' || c == '-')
        && self.at(self.idx + 1) == c
        && self.at(self.idx + 2) == '['
      {
        // Set operations: [a-z&&[aeiou]] intersection, [a-z--[aeiou]]
        // subtraction.
        self.idx += 2;
        let rhs = self.parse_bracket_chars()?;
        match u8::from(c) {
          b'&' => cc &= rhs,
          _    => cc -= rhs,
        }
        prev = None;
      } else if c == self.options.escape_character && !self.options.bracket_escapes {
        let esc_idx = self.idx;
        match self.parse_esc_in(true)? {
          Escaped::Literal(ch) => {
            cc.insert(ch);
            prev = Some(ch);
          }
          Escaped::Class(class) => {
            cc |= class;
            prev = None;
          }
          Escaped::Anchor(_) | Escaped::Bytes(_) => {
            return self.err_at(ErrorKind::InvalidClass, esc_idx);
          }
        }
        c = self.c();
        // Range continuation after an escape literal.
        if c == '-' && self.at(self.idx + 1) != ']' && prev.is_some() {
          let lo = prev.take().unwrap();
          self.idx += 1;
          let hi = self.parse_class_range_end()?;
          if lo > hi {
            return self.err(ErrorKind::InvalidClassRange);
          }
          cc.insert_pair(lo, hi);
        }
        c = self.c();
        continue;
      } else if c == '-' && prev.is_some() && self.at(self.idx + 1) != ']' {
        let lo = prev.take().unwrap();
        self.idx += 1;
        let hi = self.parse_class_range_end()?;
        if lo > hi {
          return self.err(ErrorKind::InvalidClassRange);
        }
        cc.insert_pair(lo, hi);
      } else {
        cc.insert(c);
        prev = Some(c);
        self.idx += 1;
      }

      c = self.c();
    }

    if c == '\0' {
      return self.err_at(ErrorKind::MismatchedBrackets, open_idx);
    }
    self.idx += 1; // step over ']'

    if negate {
      cc.flip();
    }
    Ok(cc)
  }

  /// Parses the upper bound of a class range `a-b`, which may be an escape.
  fn parse_class_range_end(&mut self) -> Result<Char> {
    let c = self.c();
    if c == self.options.escape_character && !self.options.bracket_escapes {
      let esc_idx = self.idx;
      match self.parse_esc_in(true)? {
        Escaped::Literal(ch) => Ok(ch),
        _ => self.err_at(ErrorKind::InvalidClassRange, esc_idx),
      }
    } else if c == '\0' || c == ']' {
      self.err(ErrorKind::InvalidClassRange)
    } else {
      self.idx += 1;
      Ok(c)
    }
  }

  /// Parses `"..."` (under `q` mode) and `\Q...\E` quotations into a chain
  /// of literal positions.
  fn parse_quoted(&mut self, group: &mut Group) -> Result<()> {
    let double_quotes: bool = self.c() == '"';
    let quote_open_idx = self.idx;

    if !double_quotes {
      self.idx += 2; // step over \Q
    } else {
      self.idx += 1; // step over "
    }

    let quote_start = self.idx;
    let mut p: Option<Position> = None;

    loop {
      let c = self.c();
      if c == '\0' {
        return self.err_at(ErrorKind::MismatchedQuotation, quote_open_idx);
      }
      if double_quotes {
        if c == '"' {
          break;
        }
        if c == self.options.escape_character && self.at(self.idx + 1) == '"' {
          self.idx += 1; // \" inside "..." is a literal quote
        }
      } else if c == self.options.escape_character && self.at(self.idx + 1) == 'E' {
        break;
      }

      let pos_idx = self.idx;
      let mut cc = Chars::new();
      cc.insert(self.c());
      self.chars_at.insert(pos_idx, cc);

      let position: Position = Position(pos_idx as u64);
      if let Some(prev) = p {
        self.follow_insert(prev, position);
      } else {
        group.first_positions.insert(position);
      }
      p = Some(position);
      self.idx += 1;
    }

    if let Some(last) = p {
      group.last_positions.insert(last);
      group.nullable = false;
      self.at_begin = false;
      self.modifiers.set(Mode::q, quote_start..self.idx);
    }

    // Step over the closing `"` or `\E`.
    self.idx += if double_quotes { 1 } else { 2 };
    Ok(())
  }

  /// Parses an escaped atom (`parse_sequence` position): a literal, a class
  /// leaf, an anchor leaf, or a multi-byte UTF-8 chain.
  fn parse_escaped_atom(&mut self, group: &mut Group) -> Result<()> {
    let pos_idx = self.idx;
    match self.parse_esc()? {
      Escaped::Literal(c) => {
        let mut cc = Chars::new();
        cc.insert(c);
        self.chars_at.insert(pos_idx, cc);
        self.make_leaf(group, pos_idx);
      }
      Escaped::Class(cc) => {
        self.chars_at.insert(pos_idx, cc);
        self.make_leaf(group, pos_idx);
      }
      Escaped::Anchor(metas) => {
        let save_idx = self.idx;
        self.idx = pos_idx;
        self.make_anchor_leaf(group, metas);
        self.idx = save_idx;
      }
      Escaped::Bytes(bytes) => {
        // A multi-byte UTF-8 encoding becomes a chain of byte leaves at
        // consecutive offsets inside the escape's source span.
        let mut prev: Option<Position> = None;
        for (i, b) in bytes.iter().enumerate() {
          let byte_idx = pos_idx + i as Index32;
          let mut cc = Chars::new();
          cc.insert(Char::from(*b));
          self.chars_at.insert(byte_idx, cc);
          let position = Position(byte_idx as u64);
          match prev {
            Some(pp) => self.follow_insert(pp, position),
            None => {
              group.first_positions.insert(position);
            }
          }
          prev = Some(position);
        }
        group.last_positions.insert(prev.unwrap());
        group.nullable = false;
        self.at_begin = false;
      }
    }
    Ok(())
  }

  /// Parses one escape sequence starting at the escape character. Advances
  /// the cursor past the escape.
  fn parse_esc(&mut self) -> Result<Escaped> {
    self.parse_esc_in(false)
  }

  /// `in_class` suppresses the anchor vocabulary: inside a bracket list
  /// `\b` is a backspace, not a word boundary.
  fn parse_esc_in(&mut self, in_class: bool) -> Result<Escaped> {
    let esc_idx = self.idx;
    let mut c: Char = self.cr(); // character after the backslash

    if c == '\0' {
      return self.err_at(ErrorKind::InvalidEscape, esc_idx);
    }

    // Octal: \0NNN (exactly the leading zero plus up to three octal digits).
    if c == '0' {
      self.idx += 1;
      let mut value: u16 = 0;
      let mut digits = 0;
      while digits < 3 && self.c() >= '0' && self.c() <= '7' {
        value = (value << 3) + (u8::from(self.c()) - b'0') as u16;
        self.idx += 1;
        digits += 1;
      }
      if value > 0xFF {
        return self.err_at(ErrorKind::InvalidEscape, esc_idx);
      }
      return Ok(Escaped::Literal(Char(value)));
    }

    // Hex: \xHH and \x{HHHH}; \uHHHH with surrogate pairing.
    if c == 'x' || (c == 'u' && (self.at(self.idx + 1).is_hexdigit() || self.at(self.idx + 1) == '{')) {
      let is_u = c == 'u';
      self.idx += 1;

      let mut value: u32;
      if self.c() == '{' {
        self.idx += 1;
        value = 0;
        let mut digits = 0;
        while self.c().is_hexdigit() {
          value = (value << 4) + hex_digit(self.c());
          self.idx += 1;
          digits += 1;
        }
        if digits == 0 || digits > 6 || self.c() != '}' {
          return self.err_at(ErrorKind::InvalidEscape, esc_idx);
        }
        self.idx += 1;
      } else {
        let width = if is_u { 4 } else { 2 };
        value = 0;
        for _ in 0..width {
          if !self.c().is_hexdigit() {
            return self.err_at(ErrorKind::InvalidEscape, esc_idx);
          }
          value = (value << 4) + hex_digit(self.c());
          self.idx += 1;
        }
        // Surrogate pairing: \uD800-\uDBFF followed by \uDC00-\uDFFF.
        if is_u && (0xD800..0xDC00).contains(&value) {
          if self.c() == self.options.escape_character && self.at(self.idx + 1) == 'u' {
            self.idx += 2;
            let mut low: u32 = 0;
            for _ in 0..4 {
              if !self.c().is_hexdigit() {
                return self.err_at(ErrorKind::InvalidEscape, esc_idx);
              }
              low = (low << 4) + hex_digit(self.c());
              self.idx += 1;
            }
            if !(0xDC00..0xE000).contains(&low) {
              return self.err_at(ErrorKind::InvalidEscape, esc_idx);
            }
            value = 0x10000 + ((value - 0xD800) << 10) + (low - 0xDC00);
          } else {
            return self.err_at(ErrorKind::InvalidEscape, esc_idx);
          }
        }
      }

      if value <= 0xFF && !(self.options.unicode && value > 0x7F) {
        return Ok(Escaped::Literal(Char(value as u16)));
      }
      // Encode the code point as UTF-8 bytes.
      let ch = match char::from_u32(value) {
        Some(ch) => ch,
        None => return self.err_at(ErrorKind::InvalidEscape, esc_idx),
      };
      let mut buf = [0u8; 4];
      let encoded = ch.encode_utf8(&mut buf);
      return Ok(Escaped::Bytes(encoded.as_bytes().to_vec()));
    }

    // Control character \cX.
    if c == 'c' {
      self.idx += 1;
      let x = self.c();
      if x == '\0' {
        return self.err_at(ErrorKind::InvalidEscape, esc_idx);
      }
      self.idx += 1;
      return Ok(Escaped::Literal(Char(x.0 % 32)));
    }

    // \e escape character.
    if c == 'e' {
      self.idx += 1;
      return Ok(Escaped::Literal(Char(0x1B)));
    }

    // \N: complement of newline.
    if c == 'N' {
      self.idx += 1;
      let mut cc = Chars::all_bytes();
      cc.remove('\n'.into());
      return Ok(Escaped::Class(cc));
    }

    // \p{Name} / \P{Name}: named class.
    if (c == 'p' || c == 'P') && self.at(self.idx + 1) == '{' {
      let negated = c == 'P';
      self.idx += 2;
      let name_start = self.idx;
      while self.c().is_alphanumeric() || self.c() == '_' {
        self.idx += 1;
      }
      if self.c() != '}' {
        return self.err_at(ErrorKind::InvalidEscape, esc_idx);
      }
      let name = std::str::from_utf8(&self.regex[name_start as usize..self.idx as usize])
        .map_err(|_| RegexError::new(ErrorKind::InvalidClass, name_start))?;
      self.idx += 1;
      let mut cc = match chars::find_posix_class_by_name(name) {
        Some(class) => *class,
        None => return self.err_at(ErrorKind::InvalidClass, name_start),
      };
      if negated {
        cc.flip();
      }
      return Ok(Escaped::Class(cc));
    }

    // Anchors and indent metas.
    let anchor = match u8::from(c) {
      _ if in_class => None,
      b'A' => Some(one_meta(Meta::BeginningOfBuffer)),
      b'z' | b'Z' => Some(one_meta(Meta::EndOfBuffer)),
      b'b' => Some(match self.at_begin {
        true => {
          let mut cc = Chars::new();
          cc.insert(Meta::BeginWordBegin);
          cc.insert(Meta::EndWordBegin);
          cc
        }
        false => {
          let mut cc = Chars::new();
          cc.insert(Meta::BeginWordEnd);
          cc.insert(Meta::EndWordEnd);
          cc
        }
      }),
      b'B' => Some(one_meta(match self.at_begin {
        true  => Meta::NonWordBoundary,
        false => Meta::NonWordEnd,
      })),
      b'<' => Some(one_meta(match self.at_begin {
        true  => Meta::BeginWordBegin,
        false => Meta::BeginWordEnd,
      })),
      b'>' => Some(one_meta(match self.at_begin {
        true  => Meta::EndWordBegin,
        false => Meta::EndWordEnd,
      })),
      b'i' => Some(one_meta(Meta::IndentBoundary)),
      b'j' => Some(one_meta(Meta::DedentBoundary)),
      b'k' => Some(one_meta(Meta::UndentBoundary)),
      _ => None,
    };
    if let Some(metas) = anchor {
      self.idx += 1;
      return Ok(Escaped::Anchor(metas));
    }

    // POSIX class escape letters: \d \D \s \S \w \W \l \L \u \U \h \H \x \X.
    {
      let mut cc = Chars::new();
      if chars::add_posix_class(c, &mut cc) {
        self.idx += 1;
        return Ok(Escaped::Class(cc));
      }
    }

    // ASCII control escapes \a \b(handled above) \t \n \v \f \r.
    if let Some(descaped) = Char::try_from_escape(c) {
      self.idx += 1;
      return Ok(Escaped::Literal(descaped));
    }

    // An escaped syntax character stands for itself.
    if !c.is_alphanumeric() {
      self.idx += 1;
      return Ok(Escaped::Literal(c));
    }

    self.err_at(ErrorKind::InvalidEscape, esc_idx)
  }
}

/// The result of parsing one escape sequence.
enum Escaped {
  Literal(Char),   //< a single byte
  Class(Chars),    //< a character class such as `\d` or `\p{Alpha}`
  Anchor(Chars),   //< one or more anchor metas
  Bytes(Vec<u8>),  //< a multi-byte UTF-8 encoding
}

fn one_meta(m: Char) -> Chars {
  let mut cc = Chars::new();
  cc.insert(m);
  cc
}

fn hex_digit(c: Char) -> u32 {
  let d = u8::from(c);
  match d {
    b'0'..=b'9' => (d - b'0') as u32,
    b'a'..=b'f' => (d - b'a' + 10) as u32,
    _           => (d - b'A' + 10) as u32,
  }
}

/// Textually substitutes `{name}` macro uses. Names begin with a letter,
/// which distinguishes them from `{n,m}` repeats.
pub(crate) fn expand_macros(
  regex: &str,
  macros: &HashMap<String, String>,
  depth: usize,
) -> Result<String> {
  if !regex.contains('{') {
    return Ok(regex.to_string());
  }
  if depth > MACRO_DEPTH_MAX {
    return Err(RegexError::new(ErrorKind::ExceedsLimits, 0));
  }

  let bytes = regex.as_bytes();
  let mut out: Vec<u8> = Vec::with_capacity(regex.len());
  let mut i = 0usize;

  while i < bytes.len() {
    let b = bytes[i];
    if b == b'\\' && i + 1 < bytes.len() {
      out.push(b);
      out.push(bytes[i + 1]);
      i += 2;
      continue;
    }
    if b == b'{' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_alphabetic() {
      let name_start = i + 1;
      let mut j = name_start;
      while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
      }
      if j < bytes.len() && bytes[j] == b'}' {
        let name = &regex[name_start..j];
        match macros.get(name) {
          Some(replacement) => {
            let expanded = expand_macros(replacement, macros, depth + 1)?;
            out.extend_from_slice(expanded.as_bytes());
            i = j + 1;
            continue;
          }
          None => {
            return Err(RegexError::new(ErrorKind::UndefinedName, i as Index32));
          }
        }
      }
    }
    out.push(b);
    i += 1;
  }

  // The input was valid UTF-8 and substitution splices whole replacements,
  // so this cannot lose data.
  Ok(String::from_utf8_lossy(&out).into_owned())
}

// region Lazy/greedy position filters

/// Makes everything in `positions` greedy, except positions already lazy.
pub(crate) fn greedify(positions: &PositionSet) -> PositionSet {
  positions
    .iter()
    .map(|p| match p.lazy() != 0 {
      true  => *p,
      false => p.set_greedy(true),
    })
    .collect()
}

/// A copy of `positions` tagged with every lazy id in `lazy_set`.
pub(crate) fn lazify_set(lazy_set: &LazySet, positions: &PositionSet) -> PositionSet {
  if lazy_set.is_empty() || positions.is_empty() {
    return positions.clone();
  }
  let mut lazy_positions = PositionSet::new();
  for p in positions.iter() {
    for l in lazy_set.iter() {
      lazy_positions.insert(p.set_lazy(*l));
    }
  }
  lazy_positions
}

/// Tags a single position with every lazy id in `lazy_set` (or none).
pub(crate) fn lazify_with(lazy_set: &LazySet, position: Position) -> PositionSet {
  let mut set = PositionSet::new();
  if lazy_set.is_empty() {
    set.insert(position);
  } else {
    for l in lazy_set.iter() {
      set.insert(position.set_lazy(*l));
    }
  }
  set
}

/**
  Lazy-quantifier resolution applied to every DFA state's position set: when
  a lazy alternative can accept in this state, drop the non-greedy positions
  carrying the same lazy id so the lazy subgraph stops expanding. The accept
  position itself is normalized to lazy 0.
*/
pub fn trim_lazy(positions: &mut PositionSet) {
  let lazy_accepts: Vec<Lazy8> = positions
    .iter()
    .filter(|p| p.is_accept() && p.is_lazy())
    .map(|p| p.lazy())
    .collect();

  if lazy_accepts.is_empty() {
    return;
  }

  let trimmed: PositionSet = positions
    .iter()
    .filter(|p| {
      !(!p.is_accept() && !p.is_greedy() && p.is_lazy() && lazy_accepts.contains(&p.lazy()))
    })
    .map(|p| match p.is_accept() && p.is_lazy() {
      true  => p.set_lazy(0u8),
      false => *p,
    })
    .collect();

  *positions = trimmed;
}

// endregion


#[cfg(test)]
mod test {
  use super::*;
  use crate::chars::PosixClass;

  fn parse(regex: &str) -> Parsed {
    Parser::parse_regex(regex, &Options::default()).unwrap()
  }

  fn parse_err(regex: &str) -> RegexError {
    Parser::parse_regex(regex, &Options::default()).unwrap_err()
  }

  #[test]
  fn empty_regex_is_an_error() {
    assert_eq!(parse_err("").kind(), ErrorKind::EmptyExpression);
  }

  #[test]
  fn literal_disjunction_uses_the_trie() {
    let parsed = parse("foo|bar|baz");
    assert!(parsed.all_literal);
    assert_eq!(parsed.accept_count, 3);
    assert_eq!(parsed.string_trie.get("foo"), Some(&1));
    assert_eq!(parsed.string_trie.get("bar"), Some(&2));
    assert_eq!(parsed.string_trie.get("baz"), Some(&3));
  }

  #[test]
  fn metas_disable_the_trie() {
    let parsed = parse("foo|b[ar]r");
    assert!(!parsed.all_literal);
    assert_eq!(parsed.accept_count, 2);
  }

  #[test]
  fn single_char_graph() {
    let parsed = parse("ab");
    assert!(!parsed.all_literal || parsed.string_trie.get("ab").is_some());
    // The trie path handles "ab"; force the graph with a class.
    let parsed = parse("a[b]");
    assert_eq!(parsed.start_positions.len(), 1);
    let first = *parsed.start_positions.iter().next().unwrap();
    assert_eq!(first.idx(), 0);
    let follows = parsed.follow_of(first);
    assert_eq!(follows.len(), 1);
    assert_eq!(follows.iter().next().unwrap().idx(), 1);
  }

  #[test]
  fn alternation_assigns_accepts_in_source_order() {
    let parsed = parse("a[b]|c[d]");
    assert_eq!(parsed.accept_count, 2);
    // Each alternative's last atom flows to its accept position.
    let mut accepts: Vec<Accept32> = Vec::new();
    for (_k, set) in parsed.follow_map.iter() {
      for p in set.iter() {
        if p.is_accept() {
          accepts.push(p.accepts());
        }
      }
    }
    accepts.sort_unstable();
    assert_eq!(accepts, vec![1, 2]);
  }

  #[test]
  fn kleene_star_loops_follow() {
    let parsed = parse("[a]*[b]");
    // Position 0 is the starred atom; its follow set contains itself and the
    // class that follows at offset 4.
    let star = Position(0);
    let follows = parsed.follow_of(star);
    assert!(follows.iter().any(|p| p.idx() == 0));
    assert!(follows.iter().any(|p| p.idx() == 4));
  }

  #[test]
  fn nullable_star_start_contains_accept() {
    let parsed = parse("[a]*");
    assert!(parsed.start_positions.iter().any(|p| p.is_accept()));
  }

  #[test]
  fn bounded_repeat_duplicates_iterations() {
    let parsed = parse("[a]{3}");
    // Three copies of the atom distinguished by the iteration counter.
    let iters: HashSet<Iteration16> =
      parsed.start_positions.iter().map(|p| p.iterations()).collect();
    assert!(iters.contains(&0));
    let last_links: PositionSet = parsed.follow_of(Position(0).increment_iter(2));
    assert!(last_links.iter().any(|p| p.is_accept()));
  }

  #[test]
  fn invalid_repeat_range() {
    assert_eq!(parse_err("a{3,1}").kind(), ErrorKind::InvalidRepeat);
  }

  #[test]
  fn mismatched_parens() {
    assert_eq!(parse_err("(a[b]").kind(), ErrorKind::MismatchedParens);
    assert_eq!(parse_err("a[b])").kind(), ErrorKind::MismatchedParens);
  }

  #[test]
  fn mismatched_brackets() {
    assert_eq!(parse_err("[ab").kind(), ErrorKind::MismatchedBrackets);
  }

  #[test]
  fn invalid_class_range() {
    assert_eq!(parse_err("[Z-A]").kind(), ErrorKind::InvalidClassRange);
  }

  #[test]
  fn empty_class() {
    assert_eq!(parse_err("[a&&[b]]").kind(), ErrorKind::EmptyClass);
  }

  #[test]
  fn bracket_class_contents() {
    let parsed = parse("[a-cx]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(cc.contains('a'.into()));
    assert!(cc.contains('b'.into()));
    assert!(cc.contains('c'.into()));
    assert!(cc.contains('x'.into()));
    assert!(!cc.contains('d'.into()));
  }

  #[test]
  fn negated_bracket_class() {
    let parsed = parse("[^a-c]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(!cc.contains('a'.into()));
    assert!(cc.contains('d'.into()));
    assert!(cc.contains('\n'.into()));
  }

  #[test]
  fn posix_class_in_brackets() {
    let parsed = parse("[[:digit:]x]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(cc.contains('7'.into()));
    assert!(cc.contains('x'.into()));
    assert!(!cc.contains('a'.into()));
  }

  #[test]
  fn class_intersection_and_subtraction() {
    let parsed = parse("[a-z&&[aeiou]]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(cc.contains('e'.into()));
    assert!(!cc.contains('b'.into()));

    let parsed = parse("[a-z--[aeiou]]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(cc.contains('b'.into()));
    assert!(!cc.contains('e'.into()));
  }

  #[test]
  fn class_escapes() {
    let parsed = parse(r"[\d\t]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(cc.contains('5'.into()));
    assert!(cc.contains('\t'.into()));
    assert!(!cc.contains('a'.into()));
  }

  #[test]
  fn escape_vocabulary() {
    let parsed = parse(r"\x41[y]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(cc.contains('A'.into()));

    let parsed = parse(r"\cM[y]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(cc.contains(Char(13)));

    let parsed = parse(r"\0101[y]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(cc.contains('A'.into()));
  }

  #[test]
  fn unknown_escape_is_invalid() {
    assert_eq!(parse_err(r"a\y").kind(), ErrorKind::InvalidEscape);
  }

  #[test]
  fn word_class_escape() {
    let parsed = parse(r"\w[y]");
    let cc = parsed.chars_at.get(&0).unwrap();
    assert_eq!(*cc, PosixClass::Word);
  }

  #[test]
  fn utf8_chain_under_unicode() {
    let mut options = Options::default();
    options.unicode = true;
    let parsed = Parser::parse_regex(r"\x{E9}[y]", &options).unwrap();
    // U+00E9 is 0xC3 0xA9 in UTF-8: two chained byte positions.
    let cc0 = parsed.chars_at.get(&0).unwrap();
    let cc1 = parsed.chars_at.get(&1).unwrap();
    assert!(cc0.contains(Char(0xC3)));
    assert!(cc1.contains(Char(0xA9)));
    let follows = parsed.follow_of(Position(0));
    assert!(follows.iter().any(|p| p.idx() == 1));
  }

  #[test]
  fn anchors_produce_meta_positions() {
    let parsed = parse("^[a]$");
    let bol = parsed.chars_at.get(&0).unwrap();
    // Without the m flag the line anchors bind to the buffer.
    assert!(bol.contains(Meta::BeginningOfLine));
    let resolved = parsed.chars_at_position(Position(0).set_anchor(true));
    assert!(resolved.contains(Meta::BeginningOfBuffer));
    assert!(!resolved.contains(Meta::BeginningOfLine));

    let mut options = Options::default();
    options.multiline = true;
    let parsed = Parser::parse_regex("^[a]$", &options).unwrap();
    let resolved = parsed.chars_at_position(Position(0).set_anchor(true));
    assert!(resolved.contains(Meta::BeginningOfLine));
  }

  #[test]
  fn word_boundary_context() {
    let parsed = parse(r"\b[w]\b");
    let begin = parsed.chars_at.get(&0).unwrap();
    assert!(begin.contains(Meta::BeginWordBegin));
    assert!(begin.contains(Meta::EndWordBegin));
    let end = parsed.chars_at.get(&5).unwrap();
    assert!(end.contains(Meta::BeginWordEnd));
    assert!(end.contains(Meta::EndWordEnd));
  }

  #[test]
  fn lookahead_records_head_and_tail() {
    let parsed = parse("[a](?=[b])");
    assert_eq!(parsed.lookaheads.len(), 1);
    let (head, tail) = parsed.lookaheads[0];
    assert_eq!(parsed.head_at.get(&head), Some(&0));
    assert_eq!(parsed.tail_at.get(&tail), Some(&0));
  }

  #[test]
  fn negative_pattern_links_redo() {
    let parsed = parse("(?^[a])");
    let mut found_redo = false;
    for (_k, set) in parsed.follow_map.iter() {
      for p in set.iter() {
        if p.is_accept() && p.is_negated() {
          found_redo = true;
        }
      }
    }
    assert!(found_redo);
  }

  #[test]
  fn lazy_quantifier_tags_positions() {
    let parsed = parse("[a]*?[b]");
    assert!(parsed.start_positions.iter().any(|p| p.is_lazy()));
  }

  #[test]
  fn trim_lazy_drops_lazy_continuation() {
    let mut set = PositionSet::new();
    set.insert(Position(3).set_lazy(1u8));
    set.insert(Position(1).set_accept(true).set_lazy(1u8));
    set.insert(Position(9));
    trim_lazy(&mut set);
    assert_eq!(set.len(), 2);
    assert!(set.iter().any(|p| p.is_accept() && !p.is_lazy()));
    assert!(set.iter().any(|p| p.idx() == 9));
  }

  #[test]
  fn scoped_modifiers_set_ranges() {
    let parsed = parse("(?i:[a])[b]");
    // The class atom inside the scoped group is case-folded.
    let folded = parsed.chars_at_position(Position(4));
    assert!(folded.contains('A'.into()));
    // The atom outside is not.
    let plain = parsed.chars_at_position(Position(8));
    assert!(!plain.contains('B'.into()));
  }

  #[test]
  fn invalid_scoped_modifier() {
    assert_eq!(parse_err("(?z:a)").kind(), ErrorKind::InvalidModifier);
  }

  #[test]
  fn comment_groups_are_skipped() {
    let parsed = parse("[a](?# ignore me )[b]");
    assert_eq!(parsed.accept_count, 1);
    assert!(parsed.chars_at.get(&0).is_some());
  }

  #[test]
  fn quoted_literals() {
    let parsed = parse(r"\Qa+b\E[c]");
    // The quoted a, +, b are three chained literal positions.
    assert!(parsed.chars_at.get(&2).unwrap().contains('a'.into()));
    assert!(parsed.chars_at.get(&3).unwrap().contains('+'.into()));
    assert!(parsed.chars_at.get(&4).unwrap().contains('b'.into()));
  }

  #[test]
  fn macro_expansion() {
    let mut options = Options::default();
    options.define_macro("digit", "[0-9]");
    let parsed = Parser::parse_regex("{digit}x", &options).unwrap();
    let cc = parsed.chars_at.get(&0).unwrap();
    assert!(cc.contains('5'.into()));
  }

  #[test]
  fn undefined_macro() {
    let err = Parser::parse_regex("{nope}", &Options::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedName);
  }

  #[test]
  fn free_spacing_skips_whitespace_and_comments() {
    let mut options = Options::default();
    options.x_freespacing = true;
    let parsed = Parser::parse_regex("[a] # comment\n [b]", &options).unwrap();
    assert!(parsed.chars_at.get(&0).unwrap().contains('a'.into()));
    assert!(parsed.chars_at.get(&15).unwrap().contains('b'.into()));
  }
}
