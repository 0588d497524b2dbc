//! Campaign dispatch and connection resilience engine for WhatsApp-style
//! bulk messaging over an HTTP session provider.

pub mod breaker;
pub mod campaign;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod model;
pub mod provider;
pub mod webhook;
