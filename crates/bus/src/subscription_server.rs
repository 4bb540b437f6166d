use domain::{Address, Service, Target};
use engine::{
    Connection, DeliveryHandle, InboundMessage, LinkId, ReceiverHandle, ReceiverProps,
    SndSettleMode,
};
use tokio::sync::mpsc;

use crate::Addresser;

/// A message delivered to the application, paired with enough information
/// to later accept or release it via a `DispositionTask` run on the I/O
/// thread.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub ack: DispositionHandle,
}

/// Identifies where a delivered message's disposition should be applied.
/// A no-op if the subscription server has since been torn down.
#[derive(Debug, Clone)]
pub struct DispositionHandle {
    pub(crate) server_key: String,
    pub(crate) link_id: LinkId,
    pub(crate) delivery: DeliveryHandle,
}

struct ReceiverLink {
    link_id: LinkId,
    address: Address,
    handle: Box<dyn ReceiverHandle>,
    closed: bool,
}

/// Per-subscription group of receiver links, one per address derived from
/// the target. Shared base behaviour for RPC and Notification variants —
/// they differ only in how `attach` derives the address set, which is why
/// this models that difference as a field rather than a subclass (spec §9
/// favors composition here).
pub struct SubscriptionServer {
    key: String,
    target: Target,
    service: Service,
    listener_id: String,
    capacity: u32,
    low_water: u32,
    inbound: mpsc::Sender<Delivery>,
    links: Vec<ReceiverLink>,
    reopen_scheduled: bool,
}

impl SubscriptionServer {
    pub fn new(
        key: String,
        target: Target,
        service: Service,
        listener_id: String,
        capacity: u32,
        inbound: mpsc::Sender<Delivery>,
    ) -> Self {
        SubscriptionServer {
            key,
            target,
            service,
            listener_id,
            capacity,
            low_water: (capacity + 1) / 2,
            inbound,
            links: Vec::new(),
            reopen_scheduled: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub fn replace_inbound(&mut self, inbound: mpsc::Sender<Delivery>) {
        self.inbound = inbound;
    }

    /// Generates the concrete address list for this target/service and
    /// opens one receiver link per address with `snd-settle-mode = mixed`,
    /// granting `capacity` credits each.
    pub fn attach(
        &mut self,
        conn: &mut dyn Connection,
        addresser: &dyn Addresser,
    ) -> Result<(), domain::DriverError> {
        let addresses = self.address_set(addresser);
        self.links.clear();
        for (idx, address) in addresses.into_iter().enumerate() {
            let link_id = LinkId(format!("{}#{}", self.key, idx));
            let handle = conn.create_receiver(
                &link_id.0,
                address.as_str(),
                "",
                ReceiverProps {
                    snd_settle_mode: Some(SndSettleMode::Mixed),
                },
            )?;
            self.links.push(ReceiverLink {
                link_id,
                address,
                handle,
                closed: false,
            });
        }
        Ok(())
    }

    fn address_set(&self, addresser: &dyn Addresser) -> Vec<Address> {
        match self.service {
            Service::Rpc => vec![
                addresser.unicast_address(&self.target, self.service),
                addresser.multicast_address(&self.target, self.service),
                addresser.anycast_address(&self.target, self.service),
            ],
            Service::Notify => vec![addresser.anycast_address(&self.target, self.service)],
        }
    }

    pub fn on_link_active(&mut self, link_id: &LinkId) {
        if let Some(link) = self.links.iter_mut().find(|l| &l.link_id == link_id) {
            link.handle.add_capacity(self.capacity);
        }
    }

    /// Enqueues `{message, disposition}` into the listener's inbound queue.
    pub fn message_received(&mut self, link_id: &LinkId, msg: InboundMessage) {
        let delivery = Delivery {
            body: msg.body,
            reply_to: msg.reply_to,
            correlation_id: msg.correlation_id,
            ack: DispositionHandle {
                server_key: self.key.clone(),
                link_id: link_id.clone(),
                delivery: msg.handle,
            },
        };
        if self.inbound.try_send(delivery).is_err() {
            tracing::warn!(target = %self.key, "subscription inbound queue full or closed, dropping delivery");
        }
    }

    /// Applies an accept/release disposition and tops credit back up once
    /// it falls to the low-water mark. A no-op if the link is gone.
    pub fn disposition(&mut self, link_id: &LinkId, handle: DeliveryHandle, release: bool) {
        let Some(link) = self.links.iter_mut().find(|l| &l.link_id == link_id) else {
            return;
        };
        if release {
            link.handle.message_released(handle);
        } else {
            link.handle.message_accepted(handle);
        }
        if link.handle.capacity() <= self.low_water {
            let deficit = self.capacity.saturating_sub(link.handle.capacity());
            if deficit > 0 {
                link.handle.add_capacity(deficit);
            }
        }
    }

    pub fn on_link_closed(&mut self, link_id: &LinkId) {
        if let Some(link) = self.links.iter_mut().find(|l| &l.link_id == link_id) {
            link.closed = true;
        }
    }

    pub fn reopen_scheduled(&self) -> bool {
        self.reopen_scheduled
    }

    pub fn set_reopen_scheduled(&mut self, scheduled: bool) {
        self.reopen_scheduled = scheduled;
    }

    /// Reopens only the receivers currently in the closed state, replacing
    /// them in place.
    pub fn reopen_closed_links(
        &mut self,
        conn: &mut dyn Connection,
        addresser: &dyn Addresser,
    ) -> Result<(), domain::DriverError> {
        self.reopen_scheduled = false;
        let addresses = self.address_set(addresser);
        for link in self.links.iter_mut() {
            if !link.closed {
                continue;
            }
            let idx = link
                .link_id
                .0
                .rsplit_once('#')
                .and_then(|(_, n)| n.parse::<usize>().ok())
                .unwrap_or(0);
            let Some(address) = addresses.get(idx) else {
                continue;
            };
            let handle = conn.create_receiver(
                &link.link_id.0,
                address.as_str(),
                "",
                ReceiverProps {
                    snd_settle_mode: Some(SndSettleMode::Mixed),
                },
            )?;
            link.handle = handle;
            link.closed = false;
        }
        Ok(())
    }

    /// Destroys receiver link objects (not thread-safe under callbacks, so
    /// destruction always happens outside the callback path that
    /// discovered the fault) and clears the address list, keeping the
    /// `(target, service)` binding so re-attach can rebuild on a new
    /// connection.
    pub fn reset(&mut self) {
        for link in self.links.drain(..) {
            let mut handle = link.handle;
            handle.close();
            handle.destroy();
        }
        self.reopen_scheduled = false;
    }
}
