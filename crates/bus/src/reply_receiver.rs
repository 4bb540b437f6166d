use std::collections::HashMap;

use domain::DriverError;
use engine::{Connection, DeliveryHandle, InboundMessage, LinkId, ReceiverHandle, ReceiverProps};
use tokio::sync::oneshot;
use uuid::Uuid;

const RPC_RESPONSE_LINK: &str = "rpc-response";

/// Single receiver link for all RPC responses. Created once per connection,
/// destroyed on connection loss. Owns a correlation-id → callback map.
pub struct ReplyReceiver {
    capacity: u32,
    low_water: u32,
    handle: Option<Box<dyn ReceiverHandle>>,
    source_address: Option<String>,
    pending: HashMap<String, oneshot::Sender<Result<InboundMessage, DriverError>>>,
    ready: bool,
}

impl ReplyReceiver {
    pub fn new(capacity: u32) -> Self {
        ReplyReceiver {
            capacity,
            low_water: (capacity + 1) / 2,
            handle: None,
            source_address: None,
            pending: HashMap::new(),
            ready: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn source_address(&self) -> Option<&str> {
        self.source_address.as_deref()
    }

    /// Opens the receiver link on a freshly active connection.
    pub fn attach(&mut self, conn: &mut dyn Connection) -> Result<(), DriverError> {
        let handle = conn.create_receiver(
            RPC_RESPONSE_LINK,
            RPC_RESPONSE_LINK,
            "",
            ReceiverProps::default(),
        )?;
        self.handle = Some(handle);
        self.ready = false;
        Ok(())
    }

    /// Called on the `receiver_active` callback: grants credit and flips
    /// readiness so the Controller can attach deferred SenderLinks.
    pub fn on_active(&mut self, source_address: String) {
        if let Some(h) = self.handle.as_mut() {
            h.add_capacity(self.capacity);
        }
        self.source_address = Some(source_address);
        self.ready = true;
    }

    /// Assigns a fresh correlation id, stores `completion` under it, and
    /// returns `(id, reply_to)` for the caller to stamp onto the request.
    pub fn prepare_for_response(
        &mut self,
        completion: oneshot::Sender<Result<InboundMessage, DriverError>>,
    ) -> (String, String) {
        let id = Uuid::new_v4().simple().to_string();
        self.pending.insert(id.clone(), completion);
        (id, self.source_address.clone().unwrap_or_default())
    }

    /// Removes `id` from the map; a no-op if absent (already replied or
    /// already cancelled).
    pub fn cancel_response(&mut self, id: &str) {
        self.pending.remove(id);
    }

    /// Fails a still-pending correlation directly (used when the owning
    /// SenderLink observes a non-ACCEPTED disposition or a reset before any
    /// reply arrived).
    pub fn fail_response(&mut self, id: &str, err: DriverError) {
        if let Some(tx) = self.pending.remove(id) {
            let _ = tx.send(Err(err));
        }
    }

    /// Handles an inbound reply. Looks up `correlation_id`; if present,
    /// fires the callback exactly once and accepts the delivery. If
    /// absent, the reply is logged and modified-undeliverable so the peer
    /// can re-route or drop it. Tops credit back up once it falls to the
    /// low-water mark.
    pub fn message_received(&mut self, msg: InboundMessage) {
        let handle = msg.handle;
        match msg.correlation_id.as_deref().and_then(|id| self.pending.remove(id)) {
            Some(tx) => {
                if let Some(h) = self.handle.as_mut() {
                    h.message_accepted(handle);
                }
                let _ = tx.send(Ok(msg));
            }
            None => {
                tracing::warn!(
                    correlation_id = ?msg.correlation_id,
                    "reply receiver: no pending request for correlation id, releasing as undeliverable"
                );
                if let Some(h) = self.handle.as_mut() {
                    h.message_modified(handle, true, true);
                }
            }
        }
        self.top_up_if_low();
    }

    fn top_up_if_low(&mut self) {
        if let Some(h) = self.handle.as_mut() {
            if h.capacity() <= self.low_water {
                let deficit = self.capacity.saturating_sub(h.capacity());
                if deficit > 0 {
                    h.add_capacity(deficit);
                }
            }
        }
    }

    /// Destroys the receiver link and fails every still-pending response
    /// with a link-closed delivery failure. Called on connection loss or
    /// hard reset.
    pub fn reset(&mut self) {
        if let Some(mut h) = self.handle.take() {
            h.close();
            h.destroy();
        }
        self.ready = false;
        self.source_address = None;
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(DriverError::DeliveryFailure(
                domain::DeliveryFailureKind::LinkClosed("reply receiver reset".to_string()),
            )));
        }
    }

    pub fn link_id(&self) -> LinkId {
        LinkId(RPC_RESPONSE_LINK.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_water_rounds_up() {
        let rr = ReplyReceiver::new(200);
        assert_eq!(rr.low_water, 100);
        let rr = ReplyReceiver::new(101);
        assert_eq!(rr.low_water, 51);
    }

    #[tokio::test]
    async fn unknown_correlation_does_not_panic() {
        let mut rr = ReplyReceiver::new(10);
        rr.message_received(InboundMessage {
            correlation_id: Some("unknown".to_string()),
            reply_to: None,
            body: vec![],
            handle: DeliveryHandle(1),
        });
    }

    #[tokio::test]
    async fn cancel_response_is_idempotent() {
        let mut rr = ReplyReceiver::new(10);
        rr.cancel_response("missing");
        let (id, _) = rr.prepare_for_response(oneshot::channel().0);
        rr.cancel_response(&id);
        rr.cancel_response(&id);
    }
}
