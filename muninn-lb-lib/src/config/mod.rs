pub mod duration;
pub mod loader;
pub mod types;

pub use duration::{parse_duration, parse_duration_or};
pub use loader::load_from_path;
pub use types::*;
