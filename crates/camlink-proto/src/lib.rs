//! camlink-proto - topic command/reply protocol for camlink camera devices
//!
//! This crate turns named logical operations into writes on a shared,
//! exclusive topic transport and correlates the device's replies back to
//! the caller.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Api                               │
//! │  send_and_receive / message pack / bulk file transfer       │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐ │
//! │  │ Locksmith   │  │ Capability  │  │ Codec               │ │
//! │  │ (FIFO lock) │  │ cache       │  │ (raw/msgpack)       │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘ │
//! │                          │                                  │
//! │                 ┌────────┴────────┐                         │
//! │                 │ TopicTransport  │                         │
//! │                 │ (USB/HID/mock)  │                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replies are correlated purely by topic name, so every exchange that
//! expects a reply runs under the [`Locksmith`] when issued through the
//! exclusive variants.

pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod locksmith;
pub mod topics;
pub mod transport;

pub use api::{Api, Capability, Command, FileTransfer, ProductInfoMode, TransferTopics};
pub use codec::{DecodeKind, Decoded};
pub use config::{ApiConfig, LogConfig};
pub use error::{ApiError, ApiResult};
pub use locksmith::Locksmith;
pub use transport::{Message, TopicTransport, TransportError};

// Re-export for convenience
pub use rmpv::Value;
