use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

use crate::item::{value_type, CreateTrapperItem, TrapperItem};
use crate::tasks::TrapperTask;

pub const RAM_USAGE_KEY: &str = "ram.usage";

const MIB: u64 = 1024 * 1024;

/// Resident memory of the current process in whole MiB.
pub struct RamUsageTask {
    system: Mutex<System>,
    pid: Pid,
}

impl RamUsageTask {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("cannot resolve current pid: {e}"))?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
        })
    }
}

#[async_trait]
impl TrapperTask for RamUsageTask {
    fn name(&self) -> &str {
        "ram"
    }

    async fn execute(&self) -> Result<Vec<TrapperItem>> {
        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let bytes = system
            .process(self.pid)
            .map(|process| process.memory())
            .ok_or_else(|| anyhow!("process {} not found", self.pid))?;

        Ok(vec![TrapperItem::new(RAM_USAGE_KEY, (bytes / MIB).to_string())])
    }

    fn create_trapper_items(&self) -> Vec<CreateTrapperItem> {
        vec![CreateTrapperItem::new("RAM usage", RAM_USAGE_KEY, value_type::UNSIGNED, "0", "%")]
    }
}
