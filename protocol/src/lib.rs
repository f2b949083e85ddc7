pub extern crate serde;
pub extern crate serde_json;

mod message;
mod types;

pub use message::*;
pub use types::*;
