pub mod command;
pub mod dictionary;

pub use command::*;
pub use dictionary::{Dictionaries, Dictionary, StatusIds};
