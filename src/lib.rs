/*!

`remex` compiles a regular expression into a deterministic finite automaton
encoded as a compact 32-bit opcode table, then interprets that table over a
streamed input buffer. The pipeline is

```text
regex string -> Parser -> (position graph, modifiers, lookaheads)
             -> DfaBuilder -> state arena
             -> Compiler   -> opcode table + predictor tables
             -> Matcher    -> (accept index, text span)
```

A [`Pattern`](pattern::Pattern) is immutable once compiled and may be shared
by reference across threads. A [`Matcher`](matcher::Matcher) owns its buffer
and cursors and is reset per input. [`FuzzyMatcher`](fuzzy::FuzzyMatcher)
reuses the same opcode table with bounded backtracking to admit up to *k*
edits.

*/

mod limits;
pub mod character;
pub mod chars;
pub mod position;
pub mod error;
pub mod modifier;
pub mod options;
pub mod parser;
pub mod dfa;
pub mod opcode;
pub mod compiler;
pub mod predict;
pub mod pattern;
pub mod input;
pub mod buffer;
pub mod matcher;
mod advance;
pub mod fuzzy;

use std::collections::HashSet;

use defaultmap::DefaultHashMap;
use ranges::Ranges;

use position::{Position, PositionSet};

// We alias types to enforce size restrictions on their values.
pub type Lazy8       = u8;  //< Lazy quantifier ids
pub type Accept32    = u32; //< Accepted alternative numbers
pub type Index32     = u32; //< An index into the regex string or opcode table
pub type Iteration16 = u16; //< Iteration values for bounded repeats
pub type Lookahead16 = u16; //< Lookahead ids
pub type StateId32   = u32; //< An index into the DFA state arena

pub type PredictBits8 = u8;  //< Predict match bits
pub type Hash16       = u16; //< Hash value type having max value `limits::HASH_MAX_IDX`

// Containers of the above.
pub(crate) type LazySet     = HashSet<Lazy8>;
pub(crate) type IndexRanges = Ranges<Index32>;
pub(crate) type FollowMap   = DefaultHashMap<Position, PositionSet>;

pub use error::{ErrorKind, RegexError};
pub use fuzzy::{FuzzyMatcher, FuzzyOptions};
pub use input::Input;
pub use matcher::{Matcher, Method};
pub use pattern::Pattern;

/// Accept code reported for a negative-pattern (`(?^...)`) match.
pub const REDO_ACCEPT: Accept32 = 0x7FFF_FFFF;
/// Accept code reported for the final empty emission of `split()`.
pub const EMPTY_ACCEPT: Accept32 = 0xFFFF_FFFF;
