pub mod agent;
pub mod config;
pub mod connection;
pub mod context;
pub mod control;
pub mod dashboard;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod proto;
pub mod secrets;
pub mod services;
pub mod shutdown;
pub mod task;
pub mod tls;
pub mod validation;
pub mod worker;
