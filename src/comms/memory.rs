/// In-process channel pair, used to run two sessions without sockets.

use std::sync::Mutex;

use anyhow::Result;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use super::channel::CommChannel;

/// One end of an in-memory duplex link.
pub struct MemoryChannel {
    name: String,
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Receiver<Vec<u8>>,
    /// Dropped on `close` to wake a local reader.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl MemoryChannel {
    /// Two connected ends: whatever one sends, the other receives, in order.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        (Self::new("memory-a", a_tx, a_rx), Self::new("memory-b", b_tx, b_rx))
    }

    fn new(name: &str, tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        let (close_tx, close_rx) = bounded(0);
        Self {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }
}

impl CommChannel for MemoryChannel {
    fn send_message(&self, data: &[u8]) -> Result<()> {
        let tx = self.tx.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        match tx.as_ref() {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| anyhow::anyhow!("{}: peer hung up", self.name)),
            None => anyhow::bail!("{}: channel closed", self.name),
        }
    }

    fn recv_message(&self) -> Result<Vec<u8>> {
        select! {
            recv(self.rx) -> msg => msg.map_err(|_| anyhow::anyhow!("{}: peer hung up", self.name)),
            recv(self.close_rx) -> _ => anyhow::bail!("{}: channel closed", self.name),
        }
    }

    fn close(&self) -> Result<()> {
        self.tx.lock().map_err(|e| anyhow::anyhow!("{}", e))?.take();
        self.close_tx.lock().map_err(|e| anyhow::anyhow!("{}", e))?.take();
        Ok(())
    }

    fn description(&self) -> String {
        format!("in-memory channel {}", self.name)
    }
}
