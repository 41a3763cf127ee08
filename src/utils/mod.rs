pub mod data_path;
pub mod fs_atomic;
pub mod paths;
pub mod redact;
