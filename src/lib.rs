//! # pushprox
//!
//! A reverse-scrape broker that lets a pull-based metrics collector reach
//! HTTP targets behind NAT or firewalls. Targets run an outbound-only
//! client that long-polls a centrally reachable proxy; the proxy matches
//! each collector request to a polling client, the client scrapes locally
//! and pushes the response back, and the proxy returns it on the
//! collector's original connection.
//!
//! ## Architecture
//!
//! +--------------------------------------------+
//! |   collector GET  |  /poll  |  /push        |
//! +--------------------------------------------+
//! |               Coordinator                  |
//! +--------------------------------------------+
//! |  request rendezvous  |  response rendezvous|
//! +--------------------------------------------+
//! |      client registry + GC sweep            |
//! +--------------------------------------------+
//!
//! Pending requests and responses are synchronous handoffs, not queues:
//! a value only exists while its producer is still waiting on it, so a
//! disconnect on either side is observed directly instead of leaving
//! stale work behind.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod registry;
pub mod rendezvous;
pub mod server;
pub mod wire;
