//! Transport layer for topic-based device communication
//!
//! This module provides the transport abstraction the protocol client runs on:
//! - [`TopicTransport`] trait implemented by USB/HID/network backends
//! - [`mock::MockTransport`] scripted transport for testing
//!
//! # Example
//!
//! ```ignore
//! use camlink_proto::transport::{mock::MockTransport, TopicTransport};
//!
//! let transport = MockTransport::new();
//! transport.reply("camctrl/uptime", "camctrl/uptime_reply", 12.5f64.to_le_bytes().to_vec());
//! let mut incoming = transport.listen();
//! transport.write("camctrl/uptime", &[]).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

pub use adapter::{Message, TopicTransport};
pub use error::TransportError;
