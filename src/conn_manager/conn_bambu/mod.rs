pub mod bambu_listener;
pub mod bambu_proto;
pub mod command;
pub mod ftps;
pub mod message;
mod parse;
