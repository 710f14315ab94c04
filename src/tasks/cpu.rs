use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

use crate::item::{value_type, CreateTrapperItem, TrapperItem};
use crate::tasks::TrapperTask;

pub const CPU_USAGE_KEY: &str = "cpu.usage";

/// Processor usage of the current process, measured over a one-second window.
pub struct CpuUsageTask {
    system: Mutex<System>,
    pid: Pid,
    window: Duration,
}

impl CpuUsageTask {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("cannot resolve current pid: {e}"))?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
            window: Duration::from_secs(1),
        })
    }
}

#[async_trait]
impl TrapperTask for CpuUsageTask {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn execute(&self) -> Result<Vec<TrapperItem>> {
        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        tokio::time::sleep(self.window).await;
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

        let usage = system
            .process(self.pid)
            .map(|process| process.cpu_usage())
            .ok_or_else(|| anyhow!("process {} not found", self.pid))?;

        Ok(vec![TrapperItem::new(CPU_USAGE_KEY, usage.to_string())])
    }

    fn create_trapper_items(&self) -> Vec<CreateTrapperItem> {
        vec![CreateTrapperItem::new("CPU usage", CPU_USAGE_KEY, value_type::UNSIGNED, "0", "%")]
    }
}
