use serde::{Deserialize, Serialize};

pub type CardId = u16;

/// One entry of a configurable deck: the title/artwork pair a field
/// card is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardFace {
    pub id: CardId,
    pub title: String,
    pub url: String,
}

/// A card dealt onto the field. A captured card is permanently inert:
/// its title and artwork are cleared and it never takes part in play
/// again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub title: String,
    pub url: String,
    pub captured: bool,
}

impl Card {
    pub fn from_face(id: CardId, face: &CardFace) -> Self {
        Card {
            id,
            title: face.title.clone(),
            url: face.url.clone(),
            captured: false,
        }
    }

    /// Pre-captured filler for grids larger than the deck.
    pub fn placeholder(id: CardId) -> Self {
        Card {
            id,
            title: String::new(),
            url: String::new(),
            captured: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

/// Presentation hints describing the most recent field mutation.
/// Cleared wholesale before the next mutation; carries no game-logic
/// meaning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMarker {
    #[serde(rename = "markMoved", skip_serializing_if = "Option::is_none")]
    pub moved: Option<Direction>,
    #[serde(rename = "markTeleported", skip_serializing_if = "Option::is_none")]
    pub teleported: Option<Direction>,
    #[serde(rename = "markCaptured", skip_serializing_if = "Option::is_none")]
    pub captured: Option<bool>,
    #[serde(rename = "markAsked", skip_serializing_if = "Option::is_none")]
    pub asked: Option<bool>,
}

impl CardMarker {
    pub fn is_empty(&self) -> bool {
        self.moved.is_none()
            && self.teleported.is_none()
            && self.captured.is_none()
            && self.asked.is_none()
    }
}

/// A card merged with its current marker, as broadcast to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardView {
    pub id: CardId,
    pub title: String,
    pub url: String,
    pub captured: bool,
    #[serde(flatten)]
    pub marker: CardMarker,
}
