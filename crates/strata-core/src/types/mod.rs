//! Core types for strata.

mod filter;
mod fragment;
mod message;

pub use filter::*;
pub use fragment::*;
pub use message::*;
