//! Fleetd - fleet agent for appstack bootstrap and remote command consumption

pub mod appstack;
pub mod bootstrap;
pub mod commands;
pub mod config;
pub mod consumer;
pub mod environment;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod precedence;
pub mod queue;
pub mod repo;
pub mod report;
pub mod script;
pub mod telemetry;
