//! Per-class request queues.
//!
//! Replies carry no request identifier, so two requests of one class in
//! flight at once could not be told apart. Each [`QueuedDispatcher`] keeps
//! at most one request outstanding. A request sent to an empty queue is
//! transmitted before `send` returns; later ones go out when the head
//! retires, on the first reply or when its timer fires.

use crate::bus::AbstractBus;
use crate::error::BusError;
use gea2_protocol::Outbound;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// The unit of queueing: one independent FIFO per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Read,
    Write,
    Subscribe,
    Publish,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Read => "read",
            OperationClass::Write => "write",
            OperationClass::Subscribe => "subscribe",
            OperationClass::Publish => "publish",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Pending<R> {
    outbound: Outbound,
    reply: oneshot::Sender<Result<R, BusError>>,
}

struct State<R> {
    queue: VecDeque<Pending<R>>,
    /// Bumped on every dispatch so a stale timer cannot retire a newer head.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Shared<R> {
    class: OperationClass,
    bus: AbstractBus,
    timeout: Duration,
    state: Mutex<State<R>>,
}

impl<R> Drop for Shared<R> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Handle to one operation-class queue.
pub struct QueuedDispatcher<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for QueuedDispatcher<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R: Send + 'static> QueuedDispatcher<R> {
    /// Creates an empty queue for `class` transmitting on `bus`.
    pub fn new(class: OperationClass, bus: AbstractBus, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                class,
                bus,
                timeout,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    generation: 0,
                    timer: None,
                }),
            }),
        }
    }

    pub fn class(&self) -> OperationClass {
        self.shared.class
    }

    /// Enqueues a request, transmitting it at once if the queue was empty.
    ///
    /// The request joins the queue when this is called, not when the
    /// returned future is first polled, so call order is wire order.
    pub fn send(
        &self,
        outbound: Outbound,
    ) -> impl Future<Output = Result<R, BusError>> + Send + 'static {
        let (reply, completion) = oneshot::channel();

        {
            let mut state = self.shared.state.lock();
            state.queue.push_back(Pending { outbound, reply });
            if state.queue.len() == 1 {
                dispatch(&self.shared, &mut state);
            }
        }

        async move { completion.await.unwrap_or(Err(BusError::Closed)) }
    }

    /// Delivers a reply to the outstanding request of this class.
    pub fn resolve(&self, reply: R) {
        let mut state = self.shared.state.lock();
        match retire(&mut state) {
            Some(pending) => {
                // The caller may have stopped waiting.
                let _ = pending.reply.send(Ok(reply));
                dispatch(&self.shared, &mut state);
            }
            None => tracing::debug!("Discarding unsolicited {} reply", self.shared.class),
        }
    }

    /// Requests queued or in flight.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

/// Pops the head and disarms its timer.
fn retire<R>(state: &mut State<R>) -> Option<Pending<R>> {
    let pending = state.queue.pop_front()?;
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
    Some(pending)
}

/// Transmits the head of the queue and arms its timer.
///
/// Heads that fail to transmit complete with the error and the next entry
/// is tried, so a dead link drains the queue instead of stalling it.
fn dispatch<R: Send + 'static>(shared: &Arc<Shared<R>>, state: &mut State<R>) {
    while let Some(head) = state.queue.front() {
        match shared.bus.transmit(head.outbound.clone()) {
            Ok(_) => {
                state.generation = state.generation.wrapping_add(1);
                state.timer = Some(tokio::spawn(expire_after(
                    Arc::downgrade(shared),
                    state.generation,
                )));
                return;
            }
            Err(e) => {
                tracing::debug!("{} request failed to transmit: {}", shared.class, e);
                if let Some(pending) = state.queue.pop_front() {
                    let _ = pending.reply.send(Err(e));
                }
            }
        }
    }
}

async fn expire_after<R: Send + 'static>(shared: Weak<Shared<R>>, generation: u64) {
    let Some(timeout) = shared.upgrade().map(|shared| shared.timeout) else {
        return;
    };
    tokio::time::sleep(timeout).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = shared.state.lock();
    if state.generation != generation {
        return;
    }
    // This task is the armed timer; drop its handle rather than abort itself.
    state.timer = None;
    if let Some(pending) = state.queue.pop_front() {
        tracing::debug!("{} request timed out after {:?}", shared.class, timeout);
        let _ = pending.reply.send(Err(BusError::Timeout));
        dispatch(&shared, &mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Link, MemoryTransport};
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio_test::assert_ok;

    fn setup(timeout: Duration) -> (QueuedDispatcher<u8>, Link) {
        let (link, peer) = MemoryTransport::pair();
        let bus = AbstractBus::new(0xBB, link);
        let dispatcher = QueuedDispatcher::new(OperationClass::Read, bus, timeout);
        (dispatcher, peer)
    }

    fn request(tag: u8) -> Outbound {
        Outbound::new(0xF0)
            .with_destination(0xC0)
            .with_data(vec![tag])
    }

    #[tokio::test]
    async fn test_send_to_empty_queue_transmits_immediately() {
        let (dispatcher, mut peer) = setup(Duration::from_secs(5));

        let pending = dispatcher.send(request(1));
        // Nothing has been awaited yet.
        assert_eq!(peer.inbound.try_recv().unwrap().data.as_ref(), &[1]);

        dispatcher.resolve(4);
        assert_eq!(assert_ok!(pending.await), 4);
    }

    #[tokio::test]
    async fn test_fifo_single_outstanding() {
        let (dispatcher, mut peer) = setup(Duration::from_secs(5));

        let first = dispatcher.send(request(1));
        let second = dispatcher.send(request(2));
        let third = dispatcher.send(request(3));
        assert_eq!(dispatcher.pending(), 3);

        assert_eq!(peer.inbound.try_recv().unwrap().data.as_ref(), &[1]);
        assert!(matches!(peer.inbound.try_recv(), Err(TryRecvError::Empty)));

        dispatcher.resolve(10);
        assert_eq!(peer.inbound.try_recv().unwrap().data.as_ref(), &[2]);
        dispatcher.resolve(20);
        assert_eq!(peer.inbound.try_recv().unwrap().data.as_ref(), &[3]);
        dispatcher.resolve(30);

        assert_eq!(assert_ok!(first.await), 10);
        assert_eq!(assert_ok!(second.await), 20);
        assert_eq!(assert_ok!(third.await), 30);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_advances_queue() {
        let (dispatcher, mut peer) = setup(Duration::from_millis(500));

        let first = dispatcher.send(request(1));
        let second = dispatcher.send(request(2));

        assert_eq!(peer.inbound.recv().await.unwrap().data.as_ref(), &[1]);
        // No reply: the head times out and the next entry goes out.
        assert!(matches!(first.await, Err(BusError::Timeout)));
        assert_eq!(peer.inbound.recv().await.unwrap().data.as_ref(), &[2]);

        dispatcher.resolve(7);
        assert_eq!(assert_ok!(second.await), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_disarms_timer() {
        let (dispatcher, mut peer) = setup(Duration::from_millis(500));

        let first = dispatcher.send(request(1));
        tokio::time::sleep(Duration::from_millis(400)).await;
        dispatcher.resolve(1);
        assert_eq!(assert_ok!(first.await), 1);

        // The second request gets its own full window.
        let second = dispatcher.send(request(2));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(dispatcher.pending(), 1);
        dispatcher.resolve(2);
        assert_eq!(assert_ok!(second.await), 2);

        assert_eq!(peer.inbound.recv().await.unwrap().data.as_ref(), &[1]);
        assert_eq!(peer.inbound.recv().await.unwrap().data.as_ref(), &[2]);
    }

    #[tokio::test]
    async fn test_unsolicited_reply_discarded() {
        let (dispatcher, mut peer) = setup(Duration::from_secs(5));

        dispatcher.resolve(99);

        let pending = dispatcher.send(request(1));
        peer.inbound.recv().await.unwrap();
        dispatcher.resolve(1);
        assert_eq!(assert_ok!(pending.await), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_does_not_stall() {
        let (dispatcher, peer) = setup(Duration::from_secs(5));
        drop(peer);

        let first = dispatcher.send(request(1));
        let second = dispatcher.send(request(2));
        assert!(matches!(first.await, Err(BusError::Transport(_))));
        assert!(matches!(second.await, Err(BusError::Transport(_))));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_dropped_queue_closes_pending() {
        let (dispatcher, _peer) = setup(Duration::from_secs(5));

        let pending = dispatcher.send(request(1));
        drop(dispatcher);
        assert!(matches!(pending.await, Err(BusError::Closed)));
    }

    #[test]
    fn test_class_names() {
        assert_eq!(OperationClass::Read.to_string(), "read");
        assert_eq!(OperationClass::Publish.as_str(), "publish");
    }
}
