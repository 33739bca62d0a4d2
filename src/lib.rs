// vlessmux library crate
//
// Keeps a local SOCKS5 proxy alive on top of an external VLESS engine,
// choosing among stored custom configs and a remotely published list.

// Infrastructure
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;

// Candidate documents and where they come from
pub mod candidate;
pub mod fetcher;
pub mod store;

// Latency probing and other cross-cutting helpers
pub mod shared;

// Engine lifecycle, health check and the state machine driving both
pub mod orchestrator;
pub mod supervisor;
pub mod validator;
