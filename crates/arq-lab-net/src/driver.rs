//! Runs an [`Endpoint`] against a real UDP socket.
//!
//! The endpoint never touches the socket itself. Each callback writes into a
//! [`NetContext`], and the loop flushes the buffered datagrams and deliveries
//! once the callback returns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use arq_lab_abstract::{Endpoint, LinkContext};
use arq_lab_protocol::Delivery;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::socket::{DatagramSocket, TransportError};

/// Buffers everything an endpoint asks for during one callback.
struct NetContext {
    started: Instant,
    outgoing: Vec<Bytes>,
    deliveries: Vec<Delivery>,
    timers: HashMap<u32, Instant>,
}

impl NetContext {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            outgoing: Vec::new(),
            deliveries: Vec::new(),
            timers: HashMap::new(),
        }
    }

    /// Earliest armed timer.
    fn next_deadline(&self) -> Option<(u32, Instant)> {
        self.timers
            .iter()
            .min_by_key(|(id, at)| (**at, **id))
            .map(|(id, at)| (*id, *at))
    }
}

impl LinkContext for NetContext {
    fn send_datagram(&mut self, datagram: Bytes) {
        self.outgoing.push(datagram);
    }

    fn start_timer(&mut self, delay_ms: u64, timer_id: u32) {
        self.timers
            .insert(timer_id, Instant::now() + Duration::from_millis(delay_ms));
    }

    fn cancel_timer(&mut self, timer_id: u32) {
        self.timers.remove(&timer_id);
    }

    fn deliver(&mut self, seq_num: u32, payload: &str) {
        self.deliveries.push(Delivery {
            seq_num,
            payload: payload.to_string(),
        });
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn record_metric(&mut self, name: &str, value: f64) {
        trace!(metric = name, value, "metric");
    }
}

/// Where a driven endpoint sends its datagrams.
#[derive(Debug, Clone, Copy)]
pub enum Peer {
    /// Always this address.
    Fixed(SocketAddr),
    /// Whoever sent the most recent datagram.
    ReplyToSource,
}

/// Drive `endpoint` until it reports finished or `shutdown` flips to `true`.
///
/// Deliveries go to `deliveries` when given. A closed delivery channel is not
/// an error; the payloads are dropped.
pub async fn drive<E: Endpoint>(
    endpoint: &mut E,
    socket: &DatagramSocket,
    peer: Peer,
    deliveries: Option<&mpsc::UnboundedSender<Delivery>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let mut ctx = NetContext::new();
    let mut reply_to = match peer {
        Peer::Fixed(addr) => Some(addr),
        Peer::ReplyToSource => None,
    };

    endpoint.init(&mut ctx);
    flush(&mut ctx, socket, reply_to, deliveries).await?;

    // A disarmed timer sleeps far in the future; the `armed` guard keeps the
    // branch from firing.
    let far_future = Duration::from_secs(365 * 24 * 3600);
    let timer = tokio::time::sleep(far_future);
    tokio::pin!(timer);

    loop {
        if endpoint.is_finished() {
            debug!(addr = %socket.local_addr, "endpoint finished");
            return Ok(());
        }
        if *shutdown.borrow() {
            debug!(addr = %socket.local_addr, "shutdown requested");
            return Ok(());
        }

        let next = ctx.next_deadline();
        let armed = next.is_some();
        let timer_id = match next {
            Some((id, at)) => {
                timer.as_mut().reset(at);
                id
            }
            None => {
                timer.as_mut().reset(Instant::now() + far_future);
                0
            }
        };

        tokio::select! {
            result = socket.recv_from() => {
                let (datagram, from) = result?;
                if let Peer::ReplyToSource = peer {
                    reply_to = Some(from);
                }
                trace!(%from, len = datagram.len(), "datagram in");
                endpoint.on_datagram(&mut ctx, &datagram);
            }
            _ = &mut timer, if armed => {
                ctx.timers.remove(&timer_id);
                endpoint.on_timer(&mut ctx, timer_id);
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    debug!(addr = %socket.local_addr, "shutdown handle dropped");
                    return Ok(());
                }
            }
        }

        flush(&mut ctx, socket, reply_to, deliveries).await?;
    }
}

async fn flush(
    ctx: &mut NetContext,
    socket: &DatagramSocket,
    reply_to: Option<SocketAddr>,
    deliveries: Option<&mpsc::UnboundedSender<Delivery>>,
) -> Result<(), TransportError> {
    let outgoing = std::mem::take(&mut ctx.outgoing);
    match reply_to {
        Some(dest) => {
            for datagram in outgoing {
                socket.send_to(&datagram, dest).await?;
            }
        }
        None if !outgoing.is_empty() => {
            warn!(count = outgoing.len(), "no peer known yet, dropping datagrams");
        }
        None => {}
    }

    for delivery in ctx.deliveries.drain(..) {
        if let Some(tx) = deliveries
            && tx.send(delivery).is_err()
        {
            debug!("delivery channel closed");
        }
    }
    Ok(())
}
