//! The driver crate: `Controller` is the public handle applications hold,
//! wrapping a dedicated I/O thread that runs the connection state machine
//! against whatever `engine::Engine` it was built with.

mod config;
mod controller;
mod host_list;
mod reply_receiver;
mod retry;
mod scheduler;
mod sender_link;
mod subscription_server;
mod task_queue;
mod tasks;

pub use config::Config;
pub use controller::Controller;
pub use domain::{Address, DeliveryFailureKind, DeliveryState, DriverError, Service, Target};
pub use engine::{Addresser, Engine};
pub use host_list::{HostEntry, HostList};
pub use retry::Retry;
pub use subscription_server::{Delivery, DispositionHandle};
pub use tasks::TaskHandle;
