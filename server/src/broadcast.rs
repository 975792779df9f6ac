use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

/// Stable identity of one connected participant; doubles as the
/// handle the broadcast collaborator uses to target that connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId(value.to_string())
    }
}

/// Wire event names, shared with the client.
pub mod events {
    pub const GET_OWNER_KEY: &str = "getOwnerKey";
    pub const GET_MEMBERS: &str = "getMembers";
    pub const GET_NICKNAME: &str = "getNickname";
    pub const GET_ROOM_STATUS: &str = "getRoomStatus";
    pub const GET_ACT_FLAG: &str = "getActFlag";
    pub const GET_PAUSE_FLAG: &str = "getPauseFlag";
    pub const GET_PLAYERS: &str = "getPlayers";
    pub const GET_RESTRICTIONS_TO_START: &str = "getRestrictionsToStart";
    pub const GET_TIMER: &str = "getTimer";
    pub const GET_ALL_LOG_RECORDS: &str = "getAllLogRecords";
    pub const GET_LOG_RECORD: &str = "getLogRecord";
    pub const GET_ROOM_OPTIONS: &str = "getRoomOptions";
    pub const GET_ROOM_TITLE: &str = "getRoomTitle";

    pub const GET_FIELD_CARDS: &str = "getFieldCards";
    pub const GET_SIZES: &str = "getSizes";
    pub const GET_CARD: &str = "getCard";
    pub const GET_ACT_CARD_IDS: &str = "getActCardIds";
    pub const GET_LAST_WINNER: &str = "getLastWinner";
    pub const GET_CARD_OPTIONS: &str = "getCardOptions";

    pub const GET_QUESTION: &str = "getQuestion";
    pub const GET_POLL_RESULT: &str = "getPollResult";
}

/// Delivery seam towards the transport layer. Implementations must
/// never block: the room code calls this mid-mutation.
pub trait Broadcaster: Send + Sync {
    /// Deliver to every participant currently in the room.
    fn to_room(&self, room_id: &str, event: &str, payload: Value);
    /// Deliver to one participant only.
    fn to_user(&self, user_id: &UserId, event: &str, payload: Value);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Room(String),
    User(UserId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub audience: Audience,
    pub event: String,
    pub payload: Value,
}

/// Ships outbound messages over an unbounded channel for the
/// transport to fan out. A closed receiver just drops messages, so
/// rooms keep working when nothing is listening.
pub struct ChannelBroadcaster {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelBroadcaster {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelBroadcaster { tx }, rx)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn to_room(&self, room_id: &str, event: &str, payload: Value) {
        trace!(room = room_id, event, "outbound");
        let _ = self.tx.send(OutboundMessage {
            audience: Audience::Room(room_id.to_string()),
            event: event.to_string(),
            payload,
        });
    }

    fn to_user(&self, user_id: &UserId, event: &str, payload: Value) {
        trace!(user = %user_id, event, "outbound");
        let _ = self.tx.send(OutboundMessage {
            audience: Audience::User(user_id.clone()),
            event: event.to_string(),
            payload,
        });
    }
}
