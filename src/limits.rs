/*!
  Constants specifying numeric limits of the engine.
*/

use crate::{Accept32, Index32, Iteration16};

/// Max number of iterations of a bounded repeat, e.g. `a{3,5}`.
pub(crate) const MAX_ITER: Iteration16 = u16::MAX;

/// The first 32 bits of a `Position` hold the `Position`'s index into the regex.
pub const MAX_INDEX: Index32 = u32::MAX;

// Opcode-determined limits. These maxima maintain the invariant within an
// instruction that byte3 >= byte4 if and only if the instruction is a GOTO.
// See the encoding description in the `opcode` module documentation.
pub const IMAX_IDX          : Index32  = 0xFFFF_FFFF; //< max index, also serves as a marker
pub const GOTO_MAX_IDX      : Index32  = 0xFE_FFFF;   //< max goto index (GMAX)
pub const ACCEPT_MAX        : Accept32 = 0xFD_FFFF;   //< max accept id (AMAX)
pub const LOOKAHEAD_MAX_IDX : Index32  = 0xFA_FFFF;   //< max lookahead id (LMAX)

/// Hard ceiling on the number of DFA states produced by subset construction.
pub const MAX_DFA_STATES: usize = 0xFF_FFFF;

/// Size of the predict-match hash arrays (4096).
pub const HASH_MAX_IDX: usize = 0x1000;

/// Size of the bitap character-pair hash table (1024).
pub const BTAP: usize = 0x400;

/// Longest literal prefix / needle storage retained by the predictor.
pub const PREFIX_MAX: usize = 255;

/// Most distinct needles the multi-needle prefilter will track.
pub const PIN_MAX: usize = 16;

/// Boyer-Moore skip distances are clamped to a byte.
pub const BM_SKIP_MAX: usize = 255;

/// Base allocation unit of the match buffer.
pub const BUFSZ: usize = 0x1_0000;
