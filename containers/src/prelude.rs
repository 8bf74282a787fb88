pub use crate::error::PoolError;
pub use crate::handle_pool::{Handle, HandlePool};
pub use crate::scratch::ScratchArena;
