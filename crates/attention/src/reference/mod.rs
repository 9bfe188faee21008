//! Attention that materializes the full probability matrix.
//!
//! Cached decoding runs here because callers may ask for the probabilities
//! and apply a head mask; the flash kernel is checked against it.

pub mod exact;

pub use exact::ExactAttention;
