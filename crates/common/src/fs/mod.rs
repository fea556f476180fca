mod safe_write;

pub use safe_write::{write_atomic, SafeFileWriter, WriteMode};
