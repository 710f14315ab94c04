use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

use crate::item::{value_type, CreateTrapperItem, TrapperItem};
use crate::tasks::TrapperTask;

pub const THREAD_COUNT_KEY: &str = "thread.count";

/// Number of OS threads in the current process.
pub struct ThreadUsageTask {
    system: Mutex<System>,
    pid: Pid,
}

impl ThreadUsageTask {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("cannot resolve current pid: {e}"))?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
        })
    }
}

#[async_trait]
impl TrapperTask for ThreadUsageTask {
    fn name(&self) -> &str {
        "threads"
    }

    async fn execute(&self) -> Result<Vec<TrapperItem>> {
        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} not found", self.pid))?;
        // Thread listing is only exposed on Linux.
        let count = process
            .tasks()
            .map(|tasks| tasks.len())
            .ok_or_else(|| anyhow!("thread count is not available on this platform"))?;

        Ok(vec![TrapperItem::new(THREAD_COUNT_KEY, count.to_string())])
    }

    fn create_trapper_items(&self) -> Vec<CreateTrapperItem> {
        vec![CreateTrapperItem::new("Thread count", THREAD_COUNT_KEY, value_type::UNSIGNED, "0", "")]
    }
}
