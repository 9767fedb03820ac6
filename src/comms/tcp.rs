/// Length-prefixed TCP transport between anchor and target.

use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::channel::CommChannel;

/// Largest frame accepted from the peer.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Ranging control channel over one TCP connection.
///
/// Reads and writes go through separate clones of the socket, so a reader
/// blocked waiting for the peer never holds up a send.
pub struct TcpChannel {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    peer_addr: String,
}

impl TcpChannel {
    /// Connect to an anchor (blocking).
    pub fn connect(addr: &str) -> Result<Self> {
        tracing::info!(%addr, "Connecting to anchor");
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("Failed to connect to {}", addr))?;
        Self::from_stream(stream)
    }

    /// Wrap an established stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        // Control messages are tiny and latency matters more than throughput
        stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
        let reader = stream.try_clone().context("Failed to clone TCP stream")?;

        Ok(Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(stream),
            peer_addr,
        })
    }
}

impl CommChannel for TcpChannel {
    fn send_message(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_FRAME_LEN {
            anyhow::bail!("Message too large: {} bytes", data.len());
        }
        let mut stream = self.writer.lock().map_err(|e| anyhow::anyhow!("{}", e))?;

        // Simple framing: 4-byte length prefix (big-endian) + data
        let len = data.len() as u32;
        stream.write_all(&len.to_be_bytes())?;
        stream.write_all(data)?;
        stream.flush()?;

        Ok(())
    }

    fn recv_message(&self) -> Result<Vec<u8>> {
        let mut stream = self.reader.lock().map_err(|e| anyhow::anyhow!("{}", e))?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .with_context(|| format!("Connection to {} closed", self.peer_addr))?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_FRAME_LEN {
            anyhow::bail!("Message too large: {} bytes", len);
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data)?;

        Ok(data)
    }

    fn close(&self) -> Result<()> {
        let stream = self.writer.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already torn down by the peer
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn description(&self) -> String {
        format!("TCP channel to {}", self.peer_addr)
    }
}

/// Anchor-side listener for incoming target connections.
pub struct TcpCommListener {
    listener: TcpListener,
}

impl TcpCommListener {
    /// Start listening on the given port.
    pub fn bind(port: u16) -> Result<Self> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr)
            .with_context(|| format!("Failed to bind to {}", addr))?;
        tracing::info!(%addr, "Listening for targets");

        Ok(Self { listener })
    }

    /// Accept a single connection (blocking).
    pub fn accept(&self) -> Result<TcpChannel> {
        self.listener
            .set_nonblocking(false)
            .context("Failed to configure listener")?;
        let (stream, addr) = self.listener.accept().context("Failed to accept connection")?;
        tracing::info!(peer = %addr, "Target connected");
        TcpChannel::from_stream(stream)
    }

    /// Accept a connection if one is already waiting; never blocks.
    pub fn try_accept(&self) -> Result<Option<TcpChannel>> {
        self.listener
            .set_nonblocking(true)
            .context("Failed to configure listener")?;
        match self.listener.accept() {
            Ok((stream, addr)) => {
                // Some platforms hand out accepted sockets in non-blocking mode
                stream
                    .set_nonblocking(false)
                    .context("Failed to configure accepted stream")?;
                tracing::info!(peer = %addr, "Target connected");
                TcpChannel::from_stream(stream).map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("Failed to accept connection"),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to get local address")
    }
}
