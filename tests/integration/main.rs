//! Integration tests for the loaded-latency engine.
//!
//! Run with: `cargo test --test integration`
//!
//! The full-size scenario is `#[ignore]`d; run it on a quiet machine with
//! `cargo test --release --test integration -- --ignored`.

mod fallback;
mod step_window;
mod sweep;
