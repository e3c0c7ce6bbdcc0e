pub mod buffers;
pub mod engine;
pub mod error;
pub mod fault;
pub mod metrics;
pub mod stats;
pub mod sync;

pub use buffers::{BufferPool, PoolError, Segment};
pub use engine::acceptor::{AcceptLoop, Accepted};
pub use engine::client::{ClientHarness, ClientSettings};
pub use engine::connection::{Connection, ConnectionHooks};
pub use engine::receiver::{PumpExit, ReceivePump, ReceiveSubscription};
pub use engine::registry::{ConnectionRegistry, RampStep, RampUp};
pub use engine::server::{Server, ServerHandle};
pub use error::ConnectError;
pub use fault::FailFast;
pub use sync::LockFreeStack;
