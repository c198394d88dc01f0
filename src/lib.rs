//! Tunnel the interaction with a single USB device across a reliable,
//! ordered byte stream.
//!
//! The [`parser`] half speaks the wire protocol and is symmetric between the
//! two ends; the [`host`] half owns a physical device through
//! [`host::backend::UsbDevice`] and exposes its transfers over the wire.

/// Capability bitmask sets negotiated in `hello`.
pub mod caps;
/// Device filter rules (allow/deny by class/vendor/product/version).
pub mod filter;
/// Device-side transfer engine and USB backends.
pub mod host;
/// Typed packet headers and their wire codecs.
pub mod packets;
/// Protocol codec and framing state machine.
pub mod parser;
/// Wire-level constants.
pub mod proto;

pub use caps::CapSet;
pub use filter::{FilterRules, InterfaceClass};
pub use host::{Host, HostFlags, HostReadError};
pub use parser::{PacketHandler, Parser, ParserFlags, ReadError, Transport};
