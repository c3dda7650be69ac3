//! Block cache and buffer pool.
//!
//! The LRU cache shares decoded blocks across readers; the buffer pool backs
//! blocks that should not pollute the cache.

mod buffer_pool;
mod lru;

pub use buffer_pool::{BufferHandle, BufferPool, PooledBuf};
pub use lru::{BlockCache, CacheKey, CacheStats};
