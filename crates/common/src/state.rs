use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DoorState {
    Closed,
    Open,
}

impl DoorState {
    pub fn as_str(self) -> &'static str {
        match self {
            DoorState::Closed => "CLOSED",
            DoorState::Open => "OPEN",
        }
    }
}

impl fmt::Display for DoorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity of one link, tracked separately for the sensor and the remote channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkHealth {
    Connected,
    Disconnected,
    Reconnecting,
}

impl LinkHealth {
    pub fn is_connected(self) -> bool {
        self == LinkHealth::Connected
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            LinkHealth::Disconnected => 0,
            LinkHealth::Reconnecting => 1,
            LinkHealth::Connected => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            2 => LinkHealth::Connected,
            1 => LinkHealth::Reconnecting,
            _ => LinkHealth::Disconnected,
        }
    }
}

impl fmt::Display for LinkHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkHealth::Connected => "connected",
            LinkHealth::Disconnected => "disconnected",
            LinkHealth::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Lock-free cell holding the latest `LinkHealth`, shared between a link task
/// and whoever needs a cheap read of it.
#[derive(Debug)]
pub struct HealthCell(std::sync::atomic::AtomicU8);

impl HealthCell {
    pub fn new(initial: LinkHealth) -> Self {
        Self(std::sync::atomic::AtomicU8::new(initial.to_u8()))
    }

    pub fn get(&self) -> LinkHealth {
        LinkHealth::from_u8(self.0.load(std::sync::atomic::Ordering::Acquire))
    }

    /// Stores `health`, returning the previous value.
    pub fn set(&self, health: LinkHealth) -> LinkHealth {
        LinkHealth::from_u8(self.0.swap(health.to_u8(), std::sync::atomic::Ordering::AcqRel))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Booting,
    IdleWatching,
    Recognizing,
    DoorOpen,
}
