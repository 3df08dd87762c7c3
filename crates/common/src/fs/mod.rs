pub mod atomic_write;

pub use atomic_write::{temp_path_for, write_json_atomic};
