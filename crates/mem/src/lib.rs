//! Embedded in-memory backend for the weir engine.
//!
//! Collections are lazy thunks over `Vec`s: building a handle never touches
//! data, `cache` memoizes one evaluation, and everything runs in-process.
//! Useful for tests and small embedded runs; a cluster backend implements
//! the same contracts against real distributed storage.

pub mod backend;
pub mod collection;
pub mod row;

pub use backend::MemBackend;
pub use collection::MemCollection;
pub use row::{Row, Value};
