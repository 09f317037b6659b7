//! Shared utilities.
//!
//! # Modules
//!
//! - [`debounce`]: keyed coalescing of rapid filesystem events

pub mod debounce;

pub use debounce::{DebounceError, Debouncer, DEFAULT_DEBOUNCE_MS};
