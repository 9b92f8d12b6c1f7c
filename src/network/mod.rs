//! Peer-to-peer gossip
//!
//! Length-prefixed JSON messages over TCP. Nodes exchange blocks, pending
//! transactions and peer lists, and converge on the longest valid chain. All
//! socket work sits behind the `Transport` trait.

pub mod message;
pub mod node;
pub mod peer;
pub mod transport;

pub use message::{encode_frame, read_frame, write_frame, Message, MAX_FRAME_LEN};
pub use node::{start_node, start_tcp_node, Node, NodeHandle};
pub use peer::{parse_address, Peer, PeerTable};
pub use transport::{TcpTransport, Transport};
