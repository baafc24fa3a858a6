pub mod color;
pub mod command;
pub mod commands;
pub mod connection;
pub mod dispatcher;
pub mod hub;
pub mod origin;
pub mod rate_limit;
pub mod roles;
pub mod validate;
pub mod wire;
