pub mod client;
pub mod config;
pub mod errors;
pub mod item;
pub mod logging;
pub mod protocol;
pub mod provisioning;
pub mod scheduler;
pub mod sender;
pub mod tasks;
pub mod transport;

pub use client::TrapperClient;
pub use config::SenderConfig;
pub use errors::{SchedulerError, TransportError, TrapperError};
pub use item::{CreateTrapperItem, TrapperItem};
pub use scheduler::{Scheduler, SchedulerState, TaskId};
pub use sender::{ItemSender, Sender};
pub use tasks::TrapperTask;
