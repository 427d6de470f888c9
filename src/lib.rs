//! Federated SSO broker core.
//!
//! Keeps SSO sessions (ticket-granting tickets) and one-time protocol
//! artifacts in expiring stores that can live in memory, in a redb file or in
//! a map replicated across cluster nodes, and coordinates logout across every
//! party registered on a session.

pub mod artifact;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod logout;
pub mod store;
pub mod tgt;

pub use broker::Broker;
pub use config::BrokerConfig;
