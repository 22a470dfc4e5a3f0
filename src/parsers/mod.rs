//! PEG parsers backed by [Pest](https://pest.rs/).
pub mod zfs;

pub use self::zfs::{Rule, ZfsParser};
