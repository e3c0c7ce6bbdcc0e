use crate::buffers::PoolError;
use std::io;
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, ConnectError>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("send on connection {id} failed: {source}")]
    Send {
        id: usize,
        #[source]
        source: io::Error,
    },

    #[error("receive on connection {id} failed: {source}")]
    Receive {
        id: u64,
        #[source]
        source: io::Error,
    },

    #[error("connection {id} was reset a second time")]
    RepeatedReset { id: u64 },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("connection {id} is already connected")]
    AlreadyConnected { id: usize },

    #[error("connection {id} started a send while another was in flight")]
    OverlappingSend { id: usize },
}
