//! Core library for meshlink
//!
//! This crate connects a host application to a mesh-radio peripheral over
//! Bluetooth Low Energy or wired serial, keeps that connection alive and
//! self-healing while the host may be backgrounded, and turns the raw byte
//! stream into deduplicated, identity-resolved application messages.

pub mod dedupe;
pub mod error;
pub mod framing;
pub mod keepalive;
pub mod packet;
pub mod processor;
pub mod reconnect;
pub mod transport;

// Re-export commonly used types
pub use anyhow::Result;
pub use error::TransportError;
pub use processor::{MessageProcessor, TextMessage};
pub use reconnect::ReconnectManager;
pub use transport::{ConnectionState, DeviceInfo, Transport, TransportType};

// Re-export protocol types for convenience
pub use meshtastic::{Message, protobufs};
