pub mod cache;
pub mod codec;
pub mod layout;
pub mod store;

pub use cache::{BoundedCache, CacheStats};
pub use store::{EntityHandle, EntityStore};
