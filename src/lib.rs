#![allow(unused_variables)]
#![allow(unused_imports)]
#![allow(unused_doc_comments)]

pub mod config;
pub mod conn_manager;
pub mod dispatch;
pub mod filter;
pub mod logging;
pub mod mapping;
pub mod project;
pub mod session;
pub mod status;
