use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use domain::{DeliveryFailureKind, DeliveryState, DriverError, Service, Target};
use engine::{
    Connection, DeliveryHandle, InboundMessage, LinkId, OutboundMessage,
    SenderHandle as EngineSenderHandle,
};

use crate::reply_receiver::ReplyReceiver;
use crate::retry::Retry;
use crate::Addresser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Detached,
    Opening,
    Active,
}

pub enum Completion {
    Ack(tokio::sync::oneshot::Sender<Result<(), DriverError>>),
    Reply(tokio::sync::oneshot::Sender<Result<InboundMessage, DriverError>>),
}

impl Completion {
    fn fail(self, err: DriverError) {
        match self {
            Completion::Ack(tx) => {
                let _ = tx.send(Err(err));
            }
            Completion::Reply(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    fn succeed_ack(self) {
        if let Completion::Ack(tx) = self {
            let _ = tx.send(Ok(()));
        }
        // A Reply completion is never satisfied by a bare ACCEPTED; it waits
        // for the reply message itself (or a timeout/failure), so there is
        // nothing to do here for that variant.
    }
}

pub struct SendEntry {
    pub id: u64,
    pub target: Target,
    pub service: Service,
    pub body: Vec<u8>,
    pub deadline: Option<Instant>,
    pub has_ttl: bool,
    pub retry: Retry,
    pub wait_for_ack: bool,
    pub is_rpc: bool,
    pub correlation_id: Option<String>,
    pub completion: Option<Completion>,
}

/// Per-destination sending link. States: `Detached → Opening → Active →
/// Detached`. Holds the pending queue, the unacked set, and retry
/// accounting (spec §4.3).
pub struct SenderLink {
    target: Target,
    service: Service,
    link_id: LinkId,
    state: LinkState,
    handle: Option<Box<dyn EngineSenderHandle>>,
    pending: VecDeque<SendEntry>,
    unacked: HashMap<DeliveryHandle, SendEntry>,
    /// RPC entries that reached a terminal ACCEPTED disposition but whose
    /// reply hasn't arrived yet: `entry id -> correlation id`. The entry
    /// itself already moved its `Completion` into `ReplyReceiver` when it
    /// was dispatched, so this is the only place left that can still route
    /// this send's per-task timer to the right correlation if the deadline
    /// passes before the reply does.
    acked_awaiting_reply: HashMap<u64, String>,
    next_id: u64,
}

impl SenderLink {
    pub fn new(target: Target, service: Service, link_id: LinkId) -> Self {
        SenderLink {
            target,
            service,
            link_id,
            state: LinkState::Detached,
            handle: None,
            pending: VecDeque::new(),
            unacked: HashMap::new(),
            acked_awaiting_reply: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn link_id(&self) -> &LinkId {
        &self.link_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn next_entry_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn enqueue(&mut self, entry: SendEntry) {
        self.pending.push_back(entry);
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.unacked.is_empty()
    }

    /// `Detached → Opening`: resolves the address and opens the sending
    /// link on the live connection.
    pub fn attach(
        &mut self,
        conn: &mut dyn Connection,
        addresser: &dyn Addresser,
    ) -> Result<(), DriverError> {
        let address = addresser.resolve(&self.target, self.service);
        let handle = conn.create_sender(&self.link_id.0, &self.link_id.0, address.as_str())?;
        self.handle = Some(handle);
        self.state = LinkState::Opening;
        Ok(())
    }

    /// `Opening → Active` on the `sender_active` callback.
    pub fn on_active(&mut self) {
        self.state = LinkState::Active;
    }

    fn can_send(&self) -> bool {
        self.state == LinkState::Active
            && self
                .handle
                .as_ref()
                .map(|h| h.credit() > 0)
                .unwrap_or(false)
    }

    /// Drains `pending` while `can_send` holds, stamping each message with
    /// this link's resolved address and, for RPC entries, reserving a
    /// reply correlation first.
    pub fn drain_pending(&mut self, reply_receiver: &mut ReplyReceiver) {
        while self.can_send() {
            let Some(mut entry) = self.pending.pop_front() else {
                break;
            };

            let mut correlation_id = None;
            let mut reply_to = None;
            if entry.is_rpc {
                if let Some(Completion::Reply(tx)) = entry.completion.take() {
                    let (id, addr) = reply_receiver.prepare_for_response(tx);
                    correlation_id = Some(id);
                    reply_to = Some(addr);
                }
            }
            entry.correlation_id = correlation_id.clone();

            let msg = OutboundMessage {
                id: None,
                reply_to,
                correlation_id,
                ttl: entry.deadline.map(|d| d.saturating_duration_since(Instant::now())),
                body: entry.body.clone(),
            };

            let handle = self
                .handle
                .as_mut()
                .expect("drain_pending only called while attached")
                .send(msg, entry.deadline);

            if !entry.wait_for_ack {
                if let Some(c) = entry.completion.take() {
                    c.succeed_ack();
                }
                continue;
            }

            self.unacked.insert(handle, entry);
        }
    }

    /// Locates an entry by id across `pending`/`unacked`/`acked_awaiting_reply`
    /// for a fired per-task timer; fails it with *Timeout* (TTL present, or
    /// an RPC call whose send was already ACCEPTED and is now only waiting on
    /// a reply) or *DeliveryFailure: undeliverable* (no TTL).
    pub fn on_timeout(&mut self, entry_id: u64, reply_receiver: &mut ReplyReceiver) {
        if let Some(pos) = self.pending.iter().position(|e| e.id == entry_id) {
            let entry = self.pending.remove(pos).unwrap();
            self.fail_entry(entry, reply_receiver, timeout_error);
            return;
        }
        if let Some((handle, _)) = self.unacked.iter().find(|(_, e)| e.id == entry_id) {
            let handle = *handle;
            if let Some(entry) = self.unacked.remove(&handle) {
                self.fail_entry(entry, reply_receiver, timeout_error);
            }
            return;
        }
        if let Some(correlation_id) = self.acked_awaiting_reply.remove(&entry_id) {
            reply_receiver.fail_response(&correlation_id, DriverError::Timeout);
        }
    }

    /// A terminal disposition arrived for a delivery previously handed to
    /// the wire. The transport-level `TIMED_OUT` state is suppressed by the
    /// Controller before this is called — we maintain our own timer.
    pub fn on_disposition(
        &mut self,
        handle: DeliveryHandle,
        state: DeliveryState,
        reply_receiver: &mut ReplyReceiver,
    ) {
        let Some(entry) = self.unacked.remove(&handle) else {
            return;
        };
        if state.is_accepted() {
            let id = entry.id;
            let is_rpc = entry.is_rpc;
            let correlation_id = entry.correlation_id.clone();
            if let Some(c) = entry.completion {
                c.succeed_ack();
            } else if is_rpc {
                // Completion already lives in the reply receiver's
                // correlation map; ACCEPTED alone never completes an RPC
                // call, only the reply does. Keep the id -> correlation
                // mapping around so this send's own per-task timer can still
                // fail the call with `Timeout` if the reply never arrives.
                if let Some(correlation_id) = correlation_id {
                    self.acked_awaiting_reply.insert(id, correlation_id);
                }
            }
        } else {
            let err = DriverError::DeliveryFailure(DeliveryFailureKind::Rejected(format!(
                "{:?}",
                state
            )));
            if entry.is_rpc {
                if let Some(id) = entry.correlation_id.as_deref() {
                    reply_receiver.fail_response(id, err);
                }
            } else if let Some(c) = entry.completion {
                c.fail(err);
            }
        }
    }

    /// Forcibly destroys the link, fails all unacked tasks with
    /// *DeliveryFailure("Link reset")*, then decrements retry counters on
    /// pending tasks, failing those whose counter reaches zero.
    pub fn reset(&mut self, reply_receiver: &mut ReplyReceiver) {
        self.detach_handle();
        self.fail_all_unacked(reply_receiver, "Link reset");
        self.apply_retry_to_pending(reply_receiver);
    }

    /// `sender_closed` while the connection is otherwise healthy: fail
    /// unacked, decrement retry on pending, leave survivors queued for the
    /// reopen the Controller schedules.
    ///
    /// A no-op if the link is already `Detached`: closing our own handle
    /// during `reset()` echoes back as a `SenderClosed` event on the same
    /// live stream (the mock, like a real engine, signals local-close
    /// completion this way), and that event must not re-run retry
    /// accounting a second time for the same reset.
    pub fn on_sender_closed(&mut self, reply_receiver: &mut ReplyReceiver) {
        if self.state == LinkState::Detached {
            return;
        }
        self.state = LinkState::Detached;
        self.fail_all_unacked(reply_receiver, "Sender closed");
        self.apply_retry_to_pending(reply_receiver);
    }

    /// Final-cycle teardown: reset, then fail all remaining pending with
    /// *DeliveryFailure("Link destroyed")*.
    pub fn destroy(mut self, reply_receiver: &mut ReplyReceiver) {
        self.reset(reply_receiver);
        while let Some(entry) = self.pending.pop_front() {
            self.fail_entry(entry, reply_receiver, |_| {
                DriverError::DeliveryFailure(DeliveryFailureKind::LinkClosed(
                    "Link destroyed".to_string(),
                ))
            });
        }
    }

    fn detach_handle(&mut self) {
        self.state = LinkState::Detached;
        if let Some(mut h) = self.handle.take() {
            h.close();
            h.destroy();
        }
    }

    fn fail_all_unacked(&mut self, reply_receiver: &mut ReplyReceiver, reason: &str) {
        for (_, entry) in self.unacked.drain() {
            self.fail_entry_static(entry, reply_receiver, |_| {
                DriverError::DeliveryFailure(DeliveryFailureKind::LinkClosed(reason.to_string()))
            });
        }
    }

    fn apply_retry_to_pending(&mut self, reply_receiver: &mut ReplyReceiver) {
        let mut survivors = VecDeque::with_capacity(self.pending.len());
        while let Some(mut entry) = self.pending.pop_front() {
            if entry.retry.decrement_and_check_exhausted() {
                self.fail_entry_static(entry, reply_receiver, |_| {
                    DriverError::DeliveryFailure(DeliveryFailureKind::RetriesExhausted)
                });
            } else {
                entry.correlation_id = None;
                survivors.push_back(entry);
            }
        }
        self.pending = survivors;
    }

    fn fail_entry(
        &mut self,
        entry: SendEntry,
        reply_receiver: &mut ReplyReceiver,
        err_for: impl Fn(&SendEntry) -> DriverError,
    ) {
        Self::fail_entry_static(entry, reply_receiver, err_for)
    }

    fn fail_entry_static(
        entry: SendEntry,
        reply_receiver: &mut ReplyReceiver,
        err_for: impl Fn(&SendEntry) -> DriverError,
    ) {
        let err = err_for(&entry);
        if entry.is_rpc {
            if let Some(id) = entry.correlation_id.as_deref() {
                reply_receiver.fail_response(id, err);
                return;
            }
        }
        if let Some(c) = entry.completion {
            c.fail(err);
        }
    }
}

fn timeout_error(entry: &SendEntry) -> DriverError {
    if entry.has_ttl {
        DriverError::Timeout
    } else {
        DriverError::DeliveryFailure(DeliveryFailureKind::Undeliverable)
    }
}
