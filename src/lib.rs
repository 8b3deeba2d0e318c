// PageStore - extent-backed page allocation
// A mini allocator that carves individual pages out of coarse extents
// while persisting which extents belong to each allocation stream.

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod data;
pub mod extent;
pub mod mini;

// Re-exports for convenience
pub use cache::{CacheConfig, MemCache, PageCache, PageHandle, PageType, PageWriteGuard};
pub use data::{DataConfig, LexicalKeyConfig};
pub use extent::{ExtentAllocator, RefCountAllocator};
pub use mini::MiniAllocator;

/// PageStore error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Allocator error: {0}")]
        Allocator(String),

        #[error("Cache error: {0}")]
        Cache(String),

        #[error("Config error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}
