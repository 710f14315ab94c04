//! Metric-producing tasks driven by the [`Scheduler`](crate::scheduler::Scheduler).

pub mod cpu;
pub mod ram;
pub mod threads;

use anyhow::Result;
use async_trait::async_trait;

use crate::item::{CreateTrapperItem, TrapperItem};

pub use cpu::CpuUsageTask;
pub use ram::RamUsageTask;
pub use threads::ThreadUsageTask;

/// A periodic source of trapper items.
#[async_trait]
pub trait TrapperTask: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Sample and return the current readings. May wait out a sampling window.
    async fn execute(&self) -> Result<Vec<TrapperItem>>;

    /// Item definitions this task reports, for provisioning. Independent of
    /// any execution.
    fn create_trapper_items(&self) -> Vec<CreateTrapperItem>;
}
