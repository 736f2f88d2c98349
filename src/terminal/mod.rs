//! Broker terminal access: capability traits, wire contract, ZeroMQ adapter

pub mod protocol;
pub mod traits;
pub mod zmq;

pub use protocol::{AccountPush, Inbound, TerminalCommand};
pub use traits::{InboundFrame, TerminalLink, TerminalSession};
pub use zmq::ZmqTerminal;
