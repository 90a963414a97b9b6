pub mod messages;

pub use messages::{
    KillSwitchCommand, NotificationLevel, PushMessage, TradeEvent, TradeEventKind,
};
