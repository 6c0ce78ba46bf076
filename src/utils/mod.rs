//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod bitmap;
mod partset;

pub use error::GridError;
pub use bitmap::{MemberId, MemberSet};
pub use partset::{PartitionId, PartitionSet};
pub use print::{logger_init, LogPrefix};
