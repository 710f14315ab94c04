use std::sync::Arc;

use crate::config::SenderConfig;
use crate::errors::TrapperError;
use crate::scheduler::Scheduler;
use crate::sender::Sender;

/// Owns the shared configuration, the sender and a scheduler feeding it.
pub struct TrapperClient {
    config: Arc<SenderConfig>,
    sender: Arc<Sender>,
    scheduler: Scheduler,
}

impl TrapperClient {
    /// Validate `config` and wire up the sender and scheduler. The
    /// configuration is read-only from here on.
    pub fn new(config: SenderConfig) -> Result<Self, TrapperError> {
        config.validate()?;
        let config = Arc::new(config);
        let sender = Arc::new(Sender::new(Arc::clone(&config))?);
        let scheduler = Scheduler::new(sender.clone());
        Ok(Self {
            config,
            sender,
            scheduler,
        })
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerState;

    #[test]
    fn test_client_requires_host_name() {
        assert!(matches!(
            TrapperClient::new(SenderConfig::default()),
            Err(TrapperError::MissingHostName)
        ));
    }

    #[test]
    fn test_client_shares_config() {
        let client = TrapperClient::new(SenderConfig::new("127.0.0.1", 10051, "agent")).unwrap();
        assert_eq!(client.config().host_name, "agent");
        assert_eq!(client.sender().config().host_name, "agent");
        assert_eq!(client.scheduler().state(), SchedulerState::Idle);
    }
}
