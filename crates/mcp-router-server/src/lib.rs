//! MCP Router server - wiring of the registry daemon
//!
//! The binary loads `RouterConfig`, installs logging and the optional
//! Prometheus exporter, builds the collaborators selected by the `backend`
//! section, registers the configured servers and runs until a shutdown signal.

pub mod startup;
