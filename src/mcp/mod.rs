//! Model Context Protocol client side: the tool catalog, the two HTTP
//! transports, and the executor that runs planned calls against them.

pub mod catalog;
pub mod client;
pub mod transport;
