//! Compact difficulty targets and chain-work accounting.

pub mod difficulty;
