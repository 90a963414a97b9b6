use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

/// Command broadcast on the cluster-wide `global:kill_switch` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchCommand {
    pub action: String,
    pub reason: String,
    pub triggered_by: i64,
}

impl KillSwitchCommand {
    pub const HALT_ALL: &'static str = "HALT_ALL";

    pub fn halt_all(reason: impl Into<String>, triggered_by: i64) -> Self {
        Self {
            action: Self::HALT_ALL.to_string(),
            reason: reason.into(),
            triggered_by,
        }
    }
}

/// Kind tag for personal events published on the `user:trade_events` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeEventKind {
    PriceUpdate,
    ProfitMatched,
    HedgeDeltaUpdate,
}

/// A personal event routed to one user's connected UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub user_id: i64,
    pub bot_id: i64,
    #[serde(rename = "type")]
    pub kind: TradeEventKind,
    pub data: serde_json::Value,
}

/// The top-level message enum pushed to end-user UIs over the outbound hub.
///
/// The `#[serde(tag = "type", content = "payload")]` attribute serializes the
/// enum into a clean JSON object that is easy for the frontend to handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PushMessage {
    /// A persisted notification mirrored to connected clients.
    Notification {
        user_id: i64,
        level: NotificationLevel,
        title: String,
        message: String,
        time: DateTime<Utc>,
    },
    /// A process-wide announcement, e.g. the kill switch firing.
    SystemAlert {
        level: NotificationLevel,
        message: String,
    },
    /// A personal trade event mirrored from the bus.
    TradeEvent(TradeEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kill_switch_round_trips() {
        let cmd = KillSwitchCommand::halt_all("manual halt", 7);
        let raw = serde_json::to_string(&cmd).unwrap();
        let back: KillSwitchCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(back.action, KillSwitchCommand::HALT_ALL);
    }

    #[test]
    fn trade_event_uses_screaming_snake_kind() {
        let event = TradeEvent {
            user_id: 1,
            bot_id: 2,
            kind: TradeEventKind::ProfitMatched,
            data: json!({"profit": "1.5"}),
        };
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["type"], "PROFIT_MATCHED");
    }

    #[test]
    fn push_message_is_tagged() {
        let msg = PushMessage::SystemAlert {
            level: NotificationLevel::Critical,
            message: "halted".to_string(),
        };
        let raw = serde_json::to_value(&msg).unwrap();
        assert_eq!(raw["type"], "SystemAlert");
        assert_eq!(raw["payload"]["level"], "critical");
    }
}
