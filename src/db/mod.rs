pub mod access_store;
pub mod connection;

pub use access_store::*;
pub use connection::*;
