pub mod broadcast;
pub mod flow;
pub mod quiz;
pub mod registry;
pub mod room;
pub mod spy;
pub mod turn;
