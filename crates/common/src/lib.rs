// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod fs;
pub mod limits;
pub mod process_utils;

pub use fs::{write_atomic, SafeFileWriter, WriteMode};
pub use limits::{resolve_budget, Budget, BudgetSource};
