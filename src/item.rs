use serde::{Deserialize, Serialize};

/// Zabbix item value types used in provisioning metadata.
pub mod value_type {
    pub const FLOAT: u8 = 0;
    pub const CHARACTER: u8 = 1;
    pub const LOG: u8 = 2;
    pub const UNSIGNED: u8 = 3;
    pub const TEXT: u8 = 4;
}

/// A single metric reading ready to be pushed to the trapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapperItem {
    key: String,
    value: String,
}

impl TrapperItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Item definition handed to provisioning tooling. Never sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTrapperItem {
    pub name: String,
    pub key: String,
    pub value_type: u8,
    pub delay: String,
    pub units: String,
}

impl CreateTrapperItem {
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        value_type: u8,
        delay: impl Into<String>,
        units: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            value_type,
            delay: delay.into(),
            units: units.into(),
        }
    }
}
