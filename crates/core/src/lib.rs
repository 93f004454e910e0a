//! Rill Core - shared types for the Rill reactive collection store.
//!
//! This crate provides the foundational types every other Rill crate builds on:
//!
//! - `Value`: dynamically typed row values (scalars, arrays, objects)
//! - `Key`: the primary key of a collection item
//! - `Completion`: a single-threaded task handle (pending, resolved, rejected)
//! - `Error`: error types for sync, query and translation failures
//! - `pattern_match`: LIKE / ILIKE matching used by query evaluation
//! - `debug_log!`: diagnostics routed to the browser console behind the `debug-log` feature
//!
//! # Example
//!
//! ```rust
//! use rill_core::{Key, Value};
//!
//! let row = Value::object([("id", Value::Int64(1)), ("name", Value::from("Alice"))]);
//!
//! assert_eq!(row.get_field("name"), Some(&Value::from("Alice")));
//! assert_eq!(Key::from_value(row.get_field("id").unwrap()), Some(Key::Int(1)));
//! ```

#![no_std]

extern crate alloc;

mod completion;
mod error;
mod key;
pub mod log;
pub mod pattern_match;
mod value;

pub use completion::{Completion, CompletionState};
pub use error::{Error, Result};
pub use key::Key;
pub use value::Value;
