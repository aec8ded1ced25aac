pub mod cache;
pub mod replay;
pub mod script;

pub use cache::{cache_clear, cache_stats};
pub use replay::{replay, ReplayOutput};
pub use script::{Script, Step};
