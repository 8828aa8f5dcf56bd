//! Pending-request table: correlates outbound IQ requests with their
//! responses and drives retry, exponential back-off and timeouts.
//!
//! Two indices are kept under one lock: by sequence number for response
//! lookup and by deadline for expiry scanning. Deadline keys are unique;
//! colliding deadlines are nudged forward by a microsecond until free.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use minidom::Element;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ClientConfig;
use crate::parser::ns;

/// Outcome delivered to a request's callback.
pub struct IqResponse {
    /// `true` for an iq-result, `false` for an iq-error or retry exhaustion
    pub ok: bool,
    /// First payload child of the response, or the `<error/>` element
    pub payload: Option<Element>,
    pub from: Option<String>,
    pub to: Option<String>,
}

pub type IqCallback = Box<dyn FnOnce(IqResponse) + Send>;

/// Retry parameters for one request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Initial retry interval
    pub timeout: Duration,
    /// Number of retransmissions before giving up
    pub retries: u32,
    /// Double the interval after each attempt
    pub drop_off: bool,
    /// Interval ceiling when dropping off; `None` is unbounded
    pub max_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            timeout: config.default_retry_timeout,
            retries: config.default_nr_retries,
            drop_off: config.default_drop_off,
            max_timeout: config.default_max_retry_timeout,
        }
    }
}

struct PendingRequest {
    /// Serialized stanza, preserved verbatim for retransmission
    stanza: String,
    to: Option<String>,
    callback: Option<IqCallback>,
    deadline: Instant,
    retries_left: u32,
    interval: Duration,
    drop_off: bool,
    max_interval: Option<Duration>,
}

#[derive(Default)]
struct Inner {
    next_seqnr: u32,
    by_seqnr: HashMap<u32, PendingRequest>,
    by_deadline: BTreeMap<Instant, u32>,
}

/// Work collected by a tick: stanzas to retransmit and callbacks for
/// requests whose retry budget ran out. Callbacks are invoked by the
/// caller, outside the table lock.
pub struct DueWork {
    pub retransmit: Vec<String>,
    pub expired: Vec<(IqCallback, IqResponse)>,
}

pub(crate) struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_seqnr: 1,
                ..Inner::default()
            }),
        }
    }

    /// Allocate a sequence number, serialize the request and insert it into
    /// both indices. Returns the seqnr and the wire text to transmit.
    pub fn register(
        &self,
        iq_type: &str,
        to: Option<&str>,
        body: &str,
        callback: IqCallback,
        policy: RetryPolicy,
    ) -> (u32, String) {
        let mut inner = self.inner.lock().expect("pending table mutex poisoned");

        let seqnr = inner.next_seqnr;
        inner.next_seqnr = inner.next_seqnr.wrapping_add(1);

        let stanza = match to {
            Some(to) if !to.is_empty() => format!(
                "<iq type='{}' id='{}' to='{}'>{}</iq>",
                iq_type, seqnr, to, body
            ),
            _ => format!("<iq type='{}' id='{}'>{}</iq>", iq_type, seqnr, body),
        };

        let mut deadline = Instant::now() + policy.timeout;
        while inner.by_deadline.contains_key(&deadline) {
            deadline += Duration::from_micros(1);
        }
        inner.by_deadline.insert(deadline, seqnr);
        inner.by_seqnr.insert(
            seqnr,
            PendingRequest {
                stanza: stanza.clone(),
                to: to.filter(|t| !t.is_empty()).map(String::from),
                callback: Some(callback),
                deadline,
                retries_left: policy.retries,
                interval: policy.timeout,
                drop_off: policy.drop_off,
                max_interval: policy.max_timeout,
            },
        );

        debug!(seqnr, "registered pending request");
        (seqnr, stanza)
    }

    /// Resolve a response by its id. Late, spurious or unparseable ids are
    /// silently ignored. The returned callback must be invoked by the
    /// caller after the lock is released.
    pub fn resolve(
        &self,
        id: &str,
        ok: bool,
        payload: Option<Element>,
        from: Option<String>,
        to: Option<String>,
    ) -> Option<(IqCallback, IqResponse)> {
        let seqnr: u32 = id.trim().parse().ok()?;

        let mut inner = self.inner.lock().expect("pending table mutex poisoned");
        let mut request = inner.by_seqnr.remove(&seqnr)?;
        inner.by_deadline.remove(&request.deadline);

        let callback = request.callback.take()?;
        Some((
            callback,
            IqResponse {
                ok,
                payload,
                from,
                to,
            },
        ))
    }

    /// Scan the deadline index for entries due at `now`. Each is either
    /// rescheduled for retransmission or removed and failed with a
    /// synthesized `recipient-unavailable` error.
    pub fn due(&self, now: Instant) -> DueWork {
        let mut work = DueWork {
            retransmit: Vec::new(),
            expired: Vec::new(),
        };

        let mut inner = self.inner.lock().expect("pending table mutex poisoned");
        let inner = &mut *inner;

        loop {
            let Some((&deadline, &seqnr)) = inner.by_deadline.iter().next() else {
                break;
            };
            if deadline > now {
                break;
            }
            inner.by_deadline.remove(&deadline);

            let Some(request) = inner.by_seqnr.get_mut(&seqnr) else {
                continue;
            };

            if request.retries_left > 0 {
                request.retries_left -= 1;
                if request.drop_off {
                    let doubled = request.interval * 2;
                    request.interval = match request.max_interval {
                        Some(max) => doubled.min(max),
                        None => doubled,
                    };
                }

                let mut new_deadline = now + request.interval;
                while inner.by_deadline.contains_key(&new_deadline) {
                    new_deadline += Duration::from_micros(1);
                }
                request.deadline = new_deadline;
                work.retransmit.push(request.stanza.clone());
                inner.by_deadline.insert(new_deadline, seqnr);
                debug!(seqnr, "retransmitting pending request");
            } else {
                let mut request = match inner.by_seqnr.remove(&seqnr) {
                    Some(request) => request,
                    None => continue,
                };
                if let Some(callback) = request.callback.take() {
                    work.expired.push((
                        callback,
                        IqResponse {
                            ok: false,
                            payload: Some(recipient_unavailable_error()),
                            from: request.to.clone(),
                            to: None,
                        },
                    ));
                }
                debug!(seqnr, "pending request exhausted its retries");
            }
        }

        work
    }

    /// Remove every pending request, returning its callback paired with a
    /// synthesized failure. Used at teardown.
    pub fn drain(&self) -> Vec<(IqCallback, IqResponse)> {
        let mut inner = self.inner.lock().expect("pending table mutex poisoned");
        inner.by_deadline.clear();
        inner
            .by_seqnr
            .drain()
            .filter_map(|(_, mut request)| {
                request.callback.take().map(|callback| {
                    (
                        callback,
                        IqResponse {
                            ok: false,
                            payload: Some(recipient_unavailable_error()),
                            from: request.to.clone(),
                            to: None,
                        },
                    )
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("pending table mutex poisoned")
            .by_seqnr
            .len()
    }

    #[cfg(test)]
    fn deadline_count(&self) -> usize {
        self.inner.lock().unwrap().by_deadline.len()
    }
}

/// The error delivered when a request's retry budget is exhausted.
fn recipient_unavailable_error() -> Element {
    Element::builder("error", ns::JABBER_CLIENT)
        .attr("type", "wait")
        .append(Element::builder("recipient-unavailable", ns::STANZAS).build())
        .build()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn policy(timeout_ms: u64, retries: u32, drop_off: bool) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(timeout_ms),
            retries,
            drop_off,
            max_timeout: None,
        }
    }

    #[tokio::test]
    async fn register_serializes_with_and_without_to() {
        let table = PendingTable::new();
        let (seqnr, stanza) = table.register(
            "get",
            Some("peer@x"),
            "<ping xmlns='urn:xmpp:ping'/>",
            Box::new(|_| {}),
            policy(1000, 2, false),
        );
        assert_eq!(seqnr, 1);
        assert_eq!(
            stanza,
            "<iq type='get' id='1' to='peer@x'><ping xmlns='urn:xmpp:ping'/></iq>"
        );

        let (_, stanza) = table.register(
            "set",
            None,
            "<x/>",
            Box::new(|_| {}),
            policy(1000, 2, false),
        );
        assert_eq!(stanza, "<iq type='set' id='2'><x/></iq>");
    }

    #[tokio::test]
    async fn resolve_fires_callback_exactly_once() {
        let table = PendingTable::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();

        let (seqnr, _) = table.register(
            "get",
            Some("peer@x"),
            "<ping/>",
            Box::new(move |response| {
                assert!(response.ok);
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
            policy(1000, 2, false),
        );

        let resolved = table.resolve(&seqnr.to_string(), true, None, None, None);
        assert!(resolved.is_some());
        let (callback, response) = resolved.unwrap();
        callback(response);

        // A duplicate response is a no-op.
        assert!(table
            .resolve(&seqnr.to_string(), true, None, None, None)
            .is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 0);
        assert_eq!(table.deadline_count(), 0);
    }

    #[tokio::test]
    async fn unparseable_ids_are_ignored() {
        let table = PendingTable::new();
        table.register("get", None, "<x/>", Box::new(|_| {}), policy(1000, 0, false));
        assert!(table.resolve("bind-1", true, None, None, None).is_none());
        assert!(table.resolve("", true, None, None, None).is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn due_retransmits_then_expires_with_recipient_unavailable() {
        let table = PendingTable::new();
        let outcome = Arc::new(Mutex::new(None));
        let outcome_clone = outcome.clone();

        let start = Instant::now();
        table.register(
            "get",
            Some("peer@x"),
            "<ping xmlns='urn:xmpp:ping'/>",
            Box::new(move |response| {
                *outcome_clone.lock().unwrap() = Some(response);
            }),
            policy(1000, 2, false),
        );

        // 1s: first retry. 2s: second retry. 3s: exhausted.
        let work = table.due(start + Duration::from_millis(1001));
        assert_eq!(work.retransmit.len(), 1);
        assert!(work.expired.is_empty());

        let work = table.due(start + Duration::from_millis(2002));
        assert_eq!(work.retransmit.len(), 1);
        assert!(work.expired.is_empty());

        let mut work = table.due(start + Duration::from_millis(3003));
        assert!(work.retransmit.is_empty());
        assert_eq!(work.expired.len(), 1);
        let (callback, response) = work.expired.pop().unwrap();
        callback(response);

        let response = outcome.lock().unwrap().take().expect("callback fired");
        assert!(!response.ok);
        let error = response.payload.expect("synthesized error payload");
        assert!(error.get_child("recipient-unavailable", ns::STANZAS).is_some());
        assert_eq!(response.from.as_deref(), Some("peer@x"));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn drop_off_intervals_are_non_decreasing_and_capped() {
        let table = PendingTable::new();
        let start = Instant::now();
        table.register(
            "get",
            None,
            "<x/>",
            Box::new(|_| {}),
            RetryPolicy {
                timeout: Duration::from_secs(1),
                retries: 10,
                drop_off: true,
                max_timeout: Some(Duration::from_secs(4)),
            },
        );

        // Walk the deadline index forward, collecting each interval.
        let mut intervals = Vec::new();
        let mut now = start;
        for _ in 0..6 {
            let next = {
                let inner = table.inner.lock().unwrap();
                *inner.by_deadline.keys().next().unwrap()
            };
            intervals.push(next - now);
            now = next;
            let work = table.due(next + Duration::from_micros(10));
            assert_eq!(work.retransmit.len(), 1);
        }

        for pair in intervals.windows(2) {
            assert!(pair[1] >= pair[0], "intervals must be non-decreasing");
        }
        assert!(intervals.last().unwrap() <= &Duration::from_secs(5));
    }

    #[tokio::test]
    async fn colliding_deadlines_are_nudged_apart() {
        let table = PendingTable::new();
        for _ in 0..20 {
            table.register("get", None, "<x/>", Box::new(|_| {}), policy(5000, 0, false));
        }
        // Both indices hold exactly the same records.
        assert_eq!(table.len(), 20);
        assert_eq!(table.deadline_count(), 20);
    }

    #[tokio::test]
    async fn drain_fails_everything() {
        let table = PendingTable::new();
        let fired = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let fired = fired.clone();
            table.register(
                "get",
                None,
                "<x/>",
                Box::new(move |response| {
                    assert!(!response.ok);
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
                policy(1000, 5, true),
            );
        }

        for (callback, response) in table.drain() {
            callback(response);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(table.len(), 0);
        assert_eq!(table.deadline_count(), 0);
    }
}
