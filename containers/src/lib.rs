pub mod error;
pub mod handle_pool;
pub mod prelude;
pub mod scratch;

pub use error::PoolError;
pub use handle_pool::{Handle, HandlePool};
pub use scratch::ScratchArena;
