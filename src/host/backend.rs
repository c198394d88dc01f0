//! The asynchronous USB surface the transfer engine consumes.
//!
//! The engine never talks to a USB stack directly; it submits
//! [`TransferRequest`]s against a [`UsbDevice`] and gets exactly one
//! completion callback per submission, on the backend's event thread. The
//! production implementation wraps libusb (see [`super::libusb`]); tests use
//! a scripted stand-in.

use std::io;
use std::time::Duration;

/// Speed of an attached device as reported by the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceSpeed {
    Low,
    Full,
    High,
    Super,
    #[default]
    Unknown,
}

/// Identity of a device, read once at open.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    pub speed: DeviceSpeed,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub version_bcd: u16,
}

#[derive(Clone, Debug)]
pub struct EndpointDescriptor {
    pub address: u8,
    /// Transfer type in the low two bits, as in `bmAttributes`.
    pub attributes: u8,
    /// Raw `wMaxPacketSize`, including high-speed multi-transaction bits.
    pub max_packet_size: u16,
    pub interval: u8,
    /// From the SuperSpeed companion descriptor; 0 when absent.
    pub max_streams: u32,
}

#[derive(Clone, Debug)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigDescriptor {
    pub value: u8,
    /// One entry per interface, at its currently active alt setting.
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Final state of a submitted transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

#[derive(Clone, Copy, Debug)]
pub struct IsoPacketResult {
    pub status: TransferStatus,
    pub actual: usize,
}

/// Delivered to the completion callback, exactly once per submission.
#[derive(Debug)]
pub struct TransferResult {
    pub status: TransferStatus,
    /// Bytes transferred (whole transfer).
    pub actual: usize,
    /// For input transfers, the received bytes. Isochronous input keeps the
    /// full `num_packets * packet_len` buffer; packet `i`'s bytes start at
    /// `i * packet_len` and run for `iso_packets[i].actual`.
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketResult>,
}

#[derive(Debug)]
pub enum TransferRequest {
    Control {
        endpoint: u8,
        request: u8,
        requesttype: u8,
        value: u16,
        index: u16,
        length: u16,
        /// Payload for host-to-device requests; empty for device-to-host.
        data: Vec<u8>,
        timeout: Duration,
    },
    Bulk {
        endpoint: u8,
        /// 0 means no stream.
        stream_id: u32,
        /// Read length for input endpoints.
        length: usize,
        /// Payload for output endpoints; empty for input.
        data: Vec<u8>,
    },
    Interrupt {
        endpoint: u8,
        length: usize,
        data: Vec<u8>,
    },
    Iso {
        endpoint: u8,
        num_packets: usize,
        /// Slot stride; every packet buffer starts at `i * packet_len`.
        packet_len: usize,
        /// Per-packet lengths (output may vary per packet).
        lengths: Vec<u32>,
        /// Output payload laid out at packet strides; empty for input.
        data: Vec<u8>,
    },
}

impl TransferRequest {
    pub fn endpoint(&self) -> u8 {
        match self {
            TransferRequest::Control { endpoint, .. }
            | TransferRequest::Bulk { endpoint, .. }
            | TransferRequest::Interrupt { endpoint, .. }
            | TransferRequest::Iso { endpoint, .. } => *endpoint,
        }
    }
}

/// Token for cancelling an in-flight transfer. Stays valid until the
/// transfer's completion callback returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferHandle(pub(crate) usize);

pub type CompletionFn = Box<dyn FnOnce(TransferResult) + Send>;

/// An opened USB device offering asynchronous transfer primitives.
///
/// Completion callbacks run on the backend's event-handling thread. The
/// backend must not hold any of its own locks while invoking a completion.
pub trait UsbDevice: Send + Sync {
    fn descriptor(&self) -> DeviceDescriptor;

    fn active_config(&self) -> io::Result<ConfigDescriptor>;

    /// Best effort; backends without kernel drivers ignore this.
    fn set_auto_detach_kernel_driver(&self, enable: bool);

    fn claim_interface(&self, number: u8) -> io::Result<()>;

    fn release_interface(&self, number: u8) -> io::Result<()>;

    fn set_configuration(&self, value: u8) -> io::Result<()>;

    fn set_alt_setting(&self, interface: u8, alt: u8) -> io::Result<()>;

    fn reset(&self) -> io::Result<()>;

    fn clear_halt(&self, endpoint: u8) -> io::Result<()>;

    /// Returns the number of streams actually allocated.
    fn alloc_streams(&self, endpoints: &[u8], count: u32) -> io::Result<u32>;

    fn free_streams(&self, endpoints: &[u8]) -> io::Result<()>;

    fn submit(&self, request: TransferRequest, completion: CompletionFn)
        -> io::Result<TransferHandle>;

    /// Ask for an early completion with `Cancelled` status. The completion
    /// callback still fires exactly once; a transfer that already finished
    /// completes with its real status.
    fn cancel(&self, handle: TransferHandle) -> io::Result<()>;

    /// Let completions make progress for up to `timeout`; used by drain
    /// loops. Backends with a free-running event thread may simply sleep.
    fn poll_completions(&self, timeout: Duration);
}
