use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle of one upstream connection.
///
/// `Disconnected -> Connecting -> Connected`, `Connected -> Failed` on
/// transport loss, `Failed -> Connecting` when a backoff timer fires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(
            serde_json::to_value(ConnectionState::Failed).expect("serialize"),
            serde_json::json!("failed")
        );
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::default().is_connected());
    }
}
