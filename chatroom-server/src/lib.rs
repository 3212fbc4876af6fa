//! Single-room real-time chat server.
//!
//! Clients connect over WebSocket, authenticate against an account
//! directory and share one room: presence, a bounded message log with
//! edits and deletes, typing indicators, slash commands and moderation
//! (mute, ban, bulk delete) for admins.

pub mod command;
pub mod config;
pub mod connection;
pub mod db;
pub mod directory;
pub mod error;
pub mod log;
pub mod moderation;
pub mod msgid;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod web;
