use bytes::Bytes;

/// Capabilities a runtime offers to an endpoint.
/// The simulator and the UDP driver both implement this.
pub trait LinkContext {
    /// Put a datagram on the (unreliable) channel towards the peer.
    fn send_datagram(&mut self, datagram: Bytes);

    /// Arm timer `timer_id` to fire after `delay_ms`. Re-arming replaces the
    /// previous deadline.
    fn start_timer(&mut self, delay_ms: u64, timer_id: u32);

    fn cancel_timer(&mut self, timer_id: u32);

    /// Hand an in-order payload to the application.
    fn deliver(&mut self, seq_num: u32, payload: &str);

    /// Milliseconds since the runtime started.
    fn now(&self) -> u64;

    /// Record a numeric sample (window occupancy, queue depth, ...).
    fn record_metric(&mut self, _name: &str, _value: f64) {
        // Runtimes without reporting ignore samples.
    }
}

/// One side of the transfer, written without any I/O of its own.
pub trait Endpoint {
    /// Called once before any datagram or timer.
    fn init(&mut self, _ctx: &mut dyn LinkContext) {}

    /// Called for every datagram that reaches this endpoint.
    fn on_datagram(&mut self, ctx: &mut dyn LinkContext, datagram: &[u8]);

    fn on_timer(&mut self, ctx: &mut dyn LinkContext, timer_id: u32);

    /// `true` once the endpoint has nothing left to do. Receivers never finish
    /// on their own.
    fn is_finished(&self) -> bool {
        false
    }
}
