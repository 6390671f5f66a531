pub mod buffer;
pub mod chain;
pub mod chat;
pub mod config;
pub mod id_pool;
pub mod mailbox;
pub mod outbox;
pub mod parser;
pub mod pipe;
pub mod pipeline;
pub mod redirect;
pub mod server;
pub mod session;
