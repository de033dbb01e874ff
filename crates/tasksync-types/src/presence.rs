//! Presence and connection descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A user's live status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Connected and active.
    Online,
    /// Connected but idle.
    Away,
    /// Connected, do not disturb.
    Busy,
    /// No open connection.
    #[default]
    Offline,
}

impl PresenceStatus {
    /// Precedence used when merging statuses reported for the same user by
    /// several connections or nodes. Higher wins.
    pub fn rank(self) -> u8 {
        match self {
            PresenceStatus::Online => 3,
            PresenceStatus::Busy => 2,
            PresenceStatus::Away => 1,
            PresenceStatus::Offline => 0,
        }
    }

    /// Merge two statuses, keeping the strongest.
    pub fn merge(self, other: PresenceStatus) -> PresenceStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Class of device a connection originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
    Web,
    #[default]
    Unknown,
}

impl DeviceClass {
    /// Guess the device class from a user agent string.
    pub fn from_user_agent(ua: &str) -> Self {
        let ua = ua.to_ascii_lowercase();
        if ua.contains("ipad") || ua.contains("tablet") {
            DeviceClass::Tablet
        } else if ua.contains("mobile") || ua.contains("android") || ua.contains("iphone") {
            DeviceClass::Mobile
        } else if ua.contains("electron") || ua.contains("tauri") {
            DeviceClass::Desktop
        } else if ua.contains("mozilla") {
            DeviceClass::Web
        } else {
            DeviceClass::Unknown
        }
    }
}

/// Transport negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    WebSocket,
    LongPolling,
    /// Used by tests and embedded clients that share the process.
    InProcess,
}
