//! Built-in storage backends.

mod memory;

pub use memory::{CallCounts, CursorStyle, InMemoryVectorStore};
