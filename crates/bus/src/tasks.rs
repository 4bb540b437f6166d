use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use domain::{DeliveryFailureKind, DriverError, Service, Target};
use engine::InboundMessage;

use crate::retry::Retry;
use crate::subscription_server::{Delivery, DispositionHandle};

/// The cross-thread vocabulary (spec §4.2): every way an application thread
/// can ask the I/O thread to do something. Each Job owns its own
/// completion channel; `execute` always runs on the I/O thread.
pub(crate) enum Job {
    Subscribe(SubscribeJob),
    Send(SendJob),
    RpcCall(RpcCallJob),
    Disposition(DispositionJob),
}

pub(crate) struct SubscribeJob {
    pub target: Target,
    pub service: Service,
    pub listener_id: String,
    pub capacity: u32,
    pub inbound: mpsc::Sender<Delivery>,
    pub completion: oneshot::Sender<Result<(), DriverError>>,
}

pub(crate) struct SendJob {
    pub target: Target,
    pub service: Service,
    pub body: Vec<u8>,
    pub deadline: Option<Instant>,
    pub has_ttl: bool,
    pub retry: Retry,
    pub wait_for_ack: bool,
    pub completion: oneshot::Sender<Result<(), DriverError>>,
}

pub(crate) struct RpcCallJob {
    pub target: Target,
    pub body: Vec<u8>,
    pub deadline: Instant,
    pub retry: Retry,
    pub completion: oneshot::Sender<Result<InboundMessage, DriverError>>,
}

pub(crate) struct DispositionJob {
    pub handle: DispositionHandle,
    pub release: bool,
}

/// A handle an application thread blocks on to retrieve a Job's result.
/// `wait()` blocks on the completion latch and never runs on the I/O
/// thread itself.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, DriverError>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, DriverError>>) -> Self {
        TaskHandle { rx }
    }

    pub fn wait(self) -> Result<T, DriverError> {
        self.rx.blocking_recv().unwrap_or_else(|_| {
            Err(DriverError::DeliveryFailure(DeliveryFailureKind::LinkClosed(
                "driver shut down before this task completed".to_string(),
            )))
        })
    }
}
