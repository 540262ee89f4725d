//! Property-based tests for chase construction and buffer sizing.
//!
//! Run with: `cargo test --test property`

mod buffer_split;
mod chase_permutation;
