use crate::error::{BlockchainError, Result};
use crate::network::message::{read_frame, write_frame, Message};
use crate::network::peer::parse_address;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// How the node reaches other nodes. Consensus code only ever talks to this.
pub trait Transport: Send + Sync {
    /// Send one message and wait for the single reply
    fn request(&self, peer: &str, message: &Message) -> Result<Message>;

    /// Fire and forget
    fn send(&self, peer: &str, message: &Message) -> Result<()>;
}

/// One short-lived TCP connection per request
pub struct TcpTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> TcpTransport {
        TcpTransport {
            connect_timeout,
            io_timeout,
        }
    }

    fn connect(&self, peer: &str) -> Result<TcpStream> {
        let (host, port) = parse_address(peer)
            .ok_or_else(|| BlockchainError::Network(format!("Invalid peer address {peer}")))?;
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| BlockchainError::Network(format!("Cannot resolve {peer}: {e}")))?
            .next()
            .ok_or_else(|| BlockchainError::Network(format!("No address for {peer}")))?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| BlockchainError::Network(format!("Failed to connect to {peer}: {e}")))?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Transport for TcpTransport {
    fn request(&self, peer: &str, message: &Message) -> Result<Message> {
        let mut stream = self.connect(peer)?;
        write_frame(&mut stream, message)?;
        let reply = read_frame(&mut stream)?.ok_or_else(|| {
            BlockchainError::Network(format!(
                "{peer} closed the connection without answering {}",
                message.kind()
            ))
        })?;
        let _ = stream.shutdown(Shutdown::Both);
        Ok(reply)
    }

    fn send(&self, peer: &str, message: &Message) -> Result<()> {
        let mut stream = self.connect(peer)?;
        write_frame(&mut stream, message)?;
        let _ = stream.shutdown(Shutdown::Write);
        Ok(())
    }
}
