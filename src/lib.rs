//! Boomtown - workspace, identity, and merge-queue substrate for
//! multi-agent coding fleets.

pub mod commands;
pub mod config;
pub mod error;
pub mod git;
pub mod keepalive;
pub mod lock;
pub mod mail;
pub mod manager;
pub mod mrqueue;
pub mod namepool;
pub mod refinery;
pub mod subprocess;
pub mod telemetry;
pub mod town;
pub mod townlog;
pub mod tracker;
pub mod wisp;
