//! Runs the sender and receiver endpoints over real UDP sockets with tokio.

pub mod driver;
pub mod socket;

use std::net::SocketAddr;

use arq_lab_abstract::ArqConfig;
use arq_lab_protocol::{Delivery, Receiver, Sender};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

pub use driver::{Peer, drive};
pub use socket::{DatagramSocket, MAX_DATAGRAM, TransportError};

/// Bind `local` and run `sender` until every message is acknowledged.
pub async fn run_sender(
    sender: &mut Sender,
    local: SocketAddr,
    peer: SocketAddr,
) -> Result<(), TransportError> {
    let socket = DatagramSocket::bind(local).await?;
    info!(local = %socket.local_addr, %peer, "sender bound");
    // Held for the whole call so the shutdown branch never fires.
    let (_keep_alive, shutdown) = watch::channel(false);
    drive(sender, &socket, Peer::Fixed(peer), None, shutdown).await
}

/// A receiver running on its own task.
pub struct ReceiverHandle {
    pub local_addr: SocketAddr,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<Receiver, TransportError>>,
}

impl ReceiverHandle {
    /// Next delivered payload, or `None` once the receiver task has ended.
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// Stop the receiver and hand back its final state.
    pub async fn stop(self) -> Result<Receiver, TransportError> {
        // The task may already have exited on an I/O error; its result says so.
        let _ = self.shutdown.send(true);
        self.task.await?
    }
}

/// Bind `local` and spawn a receiver that acks whoever sends to it.
pub async fn spawn_receiver(
    config: &ArqConfig,
    local: SocketAddr,
) -> Result<ReceiverHandle, TransportError> {
    let socket = DatagramSocket::bind(local).await?;
    let local_addr = socket.local_addr;
    info!(local = %local_addr, "receiver bound");

    let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut receiver = Receiver::new(config);

    let task = tokio::spawn(async move {
        drive(
            &mut receiver,
            &socket,
            Peer::ReplyToSource,
            Some(&deliveries_tx),
            shutdown_rx,
        )
        .await?;
        Ok(receiver)
    });

    Ok(ReceiverHandle {
        local_addr,
        deliveries,
        shutdown,
        task,
    })
}
