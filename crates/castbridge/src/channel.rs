use std::fmt;

use serde::{Deserialize, Serialize};

use crate::media::NowPlaying;
use crate::provider::LineupEntry;

/// Lifecycle state of a channel runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ChannelState {
    Idle,
    Starting,
    Live,
    Stopping,
    Failed(String),
}

impl ChannelState {
    pub fn is_running(&self) -> bool {
        matches!(self, ChannelState::Starting | ChannelState::Live)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::Starting => "starting",
            ChannelState::Live => "live",
            ChannelState::Stopping => "stopping",
            ChannelState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// A channel of the upstream lineup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Stable identifier used in URLs, the channel number as a string
    pub id: String,
    pub number: u32,
    pub name: String,
    pub genre: String,
    /// Upstream stream locator
    pub key: String,
    /// Account whose session opens this channel
    pub account: String,
}

impl Channel {
    pub fn from_lineup(entry: &LineupEntry, account: &str) -> Self {
        Self {
            id: entry.number.to_string(),
            number: entry.number,
            name: entry.name.clone(),
            genre: entry.genre.clone(),
            key: entry.key.clone(),
            account: account.to_string(),
        }
    }
}

/// Directory entry served to collaborators
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub id: String,
    pub number: u32,
    pub name: String,
    pub genre: String,
    pub stream_url: String,
    pub state: ChannelState,
    pub listeners: usize,
    /// Last track announced by the running channel
    pub now_playing: Option<NowPlaying>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_value(ChannelState::Live).unwrap(),
            serde_json::json!({ "state": "live" })
        );
        assert_eq!(
            serde_json::to_value(ChannelState::Failed("auth".into())).unwrap(),
            serde_json::json!({ "state": "failed", "reason": "auth" })
        );
    }

    #[test]
    fn test_channel_from_lineup() {
        let entry = LineupEntry {
            number: 20,
            key: "octane".to_string(),
            name: "Octane".to_string(),
            genre: "Rock".to_string(),
        };
        let channel = Channel::from_lineup(&entry, "main");
        assert_eq!(channel.id, "20");
        assert_eq!(channel.key, "octane");
        assert_eq!(channel.account, "main");
    }

    #[test]
    fn test_running_states() {
        assert!(ChannelState::Starting.is_running());
        assert!(ChannelState::Live.is_running());
        assert!(!ChannelState::Stopping.is_running());
        assert!(!ChannelState::Failed(String::new()).is_running());
        assert_eq!(ChannelState::Failed("x".into()).to_string(), "failed (x)");
    }
}
