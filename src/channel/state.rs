use std::fmt;

/// Lifecycle of the push connection.
///
/// `Closed → Connecting → Open → (Reconnecting ⇄ Connecting) → Open`; any
/// state returns to `Closed` on [`close`](super::EventChannel::close) or when
/// a different user opens the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// A session exists and is either connected or trying to be.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
