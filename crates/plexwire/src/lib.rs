//! # Plexwire
//!
//! The message vocabulary and wire format shared by render dispatchers and
//! render workers.
//!
//! ## Architecture
//!
//! - [`value`]: JSON values extended with byte buffers and regular expressions,
//!   lowered and raised by a replacer/reviver pair.
//! - [`message`]: the `Message` tagged union and the types it carries.
//! - [`frame`]: `u32BE` length-prefixed framing and incremental reassembly.
//!
//! This crate knows nothing about rendering or about any particular byte pipe.

pub mod error;
pub mod frame;
pub mod message;
pub mod value;

pub use error::Error;
pub use error::Result;
pub use frame::DEFAULT_MAX_FRAME_LEN;
pub use frame::FrameBuffer;
pub use frame::HEADER_LEN;
pub use frame::decode_body;
pub use frame::encode_frame;
pub use frame::encode_frame_with_limit;
pub use message::JobId;
pub use message::Message;
pub use message::RenderFailure;
pub use message::RenderOptions;
pub use value::Value;
