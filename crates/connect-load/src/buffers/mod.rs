pub mod pool;

pub use pool::{BufferPool, PoolError, Segment};
