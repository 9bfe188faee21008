//! Input-side embeddings of a decoder.
//!
//! [`TokenEmbedding`] maps ids to hidden vectors. [`RotaryEmbedding`] rotates
//! the query and key projections in place of absolute position vectors; its
//! sine/cosine tables are shared across layers and grow on demand.

pub mod rope;
pub mod token;

pub use rope::{RopeConfig, RopeError, RopeOutput, RopeResult, RotaryEmbedding, RotaryTable};
pub use token::TokenEmbedding;
