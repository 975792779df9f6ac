mod card;
mod field;

pub mod pack;

pub use card::*;
pub use field::*;
