pub mod acceptor;
pub mod client;
pub mod connection;
pub mod receiver;
pub mod registry;
pub mod server;
