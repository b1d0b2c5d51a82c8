//! Integration tests for Ebbtide
//!
//! These tests drive the connection engine the way an external event loop
//! would: constructing connections, feeding decoded handshakes and wire
//! messages, draining outbound packets, and observing state through
//! handles.

#[path = "integration/connection_lifecycle.rs"]
mod connection_lifecycle;

#[path = "integration/choke_interest.rs"]
mod choke_interest;

#[path = "integration/crypto_swap.rs"]
mod crypto_swap;

#[path = "integration/redundant_connections.rs"]
mod redundant_connections;

#[path = "integration/handle_safety.rs"]
mod handle_safety;

#[path = "integration/common.rs"]
mod common;
