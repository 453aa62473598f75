pub mod chunk;
pub mod fakes;
pub mod traits;
pub mod types;

pub use chunk::split_chunks;
pub use traits::*;
pub use types::*;
