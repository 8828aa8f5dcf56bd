//! Wire observation hook.

/// Observer for raw stream traffic. Outbound payloads are offered before
/// they enter the write queue; inbound fragments after framing. Must not
/// block: it runs on the dispatch path.
pub trait Sniffer: Send + Sync {
    fn outbound(&self, payload: &str);

    fn inbound(&self, payload: &str);
}

/// Sniffer that forwards both directions to `tracing` at TRACE level.
pub struct TracingSniffer;

impl Sniffer for TracingSniffer {
    fn outbound(&self, payload: &str) {
        tracing::trace!(direction = "out", %payload, "stream traffic");
    }

    fn inbound(&self, payload: &str) {
        tracing::trace!(direction = "in", %payload, "stream traffic");
    }
}
