//! Typed packet headers and their wire codecs.
//!
//! Every packet is a fixed main header followed by a type-specific header and
//! an optional payload. Several type headers grow when a capability has been
//! negotiated, so sizing is a function of `(type, effective caps)` rather than
//! a property of the struct. The in-memory representation is always the
//! widest layout; fields absent from a narrower wire encoding read as zero.

use crate::caps::CapSet;
use crate::proto::*;

/// Which way a packet type is allowed to travel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketDirection {
    HostToGuest,
    GuestToHost,
    Both,
}

/// Outcome of semantic validation of a decoded (or about to be sent) packet.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketCheck {
    Ok,
    /// Frame is malformed; the reader resynchronises by skipping it.
    Invalid(&'static str),
    /// Peer misused the protocol (e.g. a capability it never negotiated);
    /// log and drop the packet, the connection survives.
    Unsupported(&'static str),
}

pub const HELLO_VERSION_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HelloHeader {
    pub version: [u8; HELLO_VERSION_LEN],
}

impl HelloHeader {
    pub fn new(version: &str) -> Self {
        let mut hdr = HelloHeader {
            version: [0; HELLO_VERSION_LEN],
        };
        let n = version.len().min(HELLO_VERSION_LEN - 1);
        hdr.version[..n].copy_from_slice(&version.as_bytes()[..n]);
        hdr
    }

    pub fn version_str(&self) -> &str {
        let end = self
            .version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HELLO_VERSION_LEN);
        std::str::from_utf8(&self.version[..end]).unwrap_or("")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceConnectHeader {
    pub speed: u8,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Only on the wire when `connect_device_version` is mutual.
    pub device_version_bcd: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InterfaceInfoHeader {
    pub interface_count: u32,
    pub interface: [u8; MAX_INTERFACES],
    pub interface_class: [u8; MAX_INTERFACES],
    pub interface_subclass: [u8; MAX_INTERFACES],
    pub interface_protocol: [u8; MAX_INTERFACES],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpInfoHeader {
    pub ep_type: [u8; MAX_ENDPOINTS],
    pub interval: [u8; MAX_ENDPOINTS],
    pub interface: [u8; MAX_ENDPOINTS],
    /// Only on the wire with `ep_info_max_packet_size`.
    pub max_packet_size: [u16; MAX_ENDPOINTS],
    /// Only on the wire with `bulk_streams`.
    pub max_streams: [u32; MAX_ENDPOINTS],
}

impl Default for EpInfoHeader {
    fn default() -> Self {
        EpInfoHeader {
            ep_type: [EP_TYPE_INVALID; MAX_ENDPOINTS],
            interval: [0; MAX_ENDPOINTS],
            interface: [0; MAX_ENDPOINTS],
            max_packet_size: [0; MAX_ENDPOINTS],
            max_streams: [0; MAX_ENDPOINTS],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SetConfigurationHeader {
    pub configuration: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConfigurationStatusHeader {
    pub status: u8,
    pub configuration: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SetAltSettingHeader {
    pub interface: u8,
    pub alt: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GetAltSettingHeader {
    pub interface: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AltSettingStatusHeader {
    pub status: u8,
    pub interface: u8,
    pub alt: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StartIsoStreamHeader {
    pub endpoint: u8,
    pub pkts_per_urb: u8,
    pub no_urbs: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StopIsoStreamHeader {
    pub endpoint: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IsoStreamStatusHeader {
    pub status: u8,
    pub endpoint: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StartInterruptReceivingHeader {
    pub endpoint: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StopInterruptReceivingHeader {
    pub endpoint: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InterruptReceivingStatusHeader {
    pub status: u8,
    pub endpoint: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AllocBulkStreamsHeader {
    /// Bitmask over endpoint slot indices.
    pub endpoints: u32,
    pub no_streams: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FreeBulkStreamsHeader {
    pub endpoints: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BulkStreamsStatusHeader {
    pub endpoints: u32,
    pub no_streams: u32,
    pub status: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StartBulkReceivingHeader {
    pub stream_id: u32,
    pub bytes_per_transfer: u32,
    pub endpoint: u8,
    pub no_transfers: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StopBulkReceivingHeader {
    pub stream_id: u32,
    pub endpoint: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BulkReceivingStatusHeader {
    pub stream_id: u32,
    pub endpoint: u8,
    pub status: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ControlPacketHeader {
    pub endpoint: u8,
    pub request: u8,
    pub requesttype: u8,
    pub status: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BulkPacketHeader {
    pub endpoint: u8,
    pub status: u8,
    pub length: u16,
    pub stream_id: u32,
    /// Only on the wire with `32bits_bulk_length`; holds bits 16..31.
    pub length_high: u16,
}

impl BulkPacketHeader {
    pub fn total_length(&self) -> usize {
        self.length as usize | ((self.length_high as usize) << 16)
    }

    pub fn set_total_length(&mut self, len: usize) {
        self.length = (len & 0xffff) as u16;
        self.length_high = ((len >> 16) & 0xffff) as u16;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IsoPacketHeader {
    pub endpoint: u8,
    pub status: u8,
    pub length: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InterruptPacketHeader {
    pub endpoint: u8,
    pub status: u8,
    pub length: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BufferedBulkPacketHeader {
    pub stream_id: u32,
    pub length: u32,
    pub endpoint: u8,
    pub status: u8,
}

/// A decoded type header, tagged by packet type.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Hello(HelloHeader),
    DeviceConnect(DeviceConnectHeader),
    DeviceDisconnect,
    Reset,
    InterfaceInfo(InterfaceInfoHeader),
    EpInfo(EpInfoHeader),
    SetConfiguration(SetConfigurationHeader),
    GetConfiguration,
    ConfigurationStatus(ConfigurationStatusHeader),
    SetAltSetting(SetAltSettingHeader),
    GetAltSetting(GetAltSettingHeader),
    AltSettingStatus(AltSettingStatusHeader),
    StartIsoStream(StartIsoStreamHeader),
    StopIsoStream(StopIsoStreamHeader),
    IsoStreamStatus(IsoStreamStatusHeader),
    StartInterruptReceiving(StartInterruptReceivingHeader),
    StopInterruptReceiving(StopInterruptReceivingHeader),
    InterruptReceivingStatus(InterruptReceivingStatusHeader),
    AllocBulkStreams(AllocBulkStreamsHeader),
    FreeBulkStreams(FreeBulkStreamsHeader),
    BulkStreamsStatus(BulkStreamsStatusHeader),
    CancelDataPacket,
    FilterReject,
    FilterFilter,
    DeviceDisconnectAck,
    StartBulkReceiving(StartBulkReceivingHeader),
    StopBulkReceiving(StopBulkReceivingHeader),
    BulkReceivingStatus(BulkReceivingStatusHeader),
    ControlPacket(ControlPacketHeader),
    BulkPacket(BulkPacketHeader),
    IsoPacket(IsoPacketHeader),
    InterruptPacket(InterruptPacketHeader),
    BufferedBulkPacket(BufferedBulkPacketHeader),
}

/// The on-wire length of the type header for `ptype` under `caps`, or `None`
/// for an unknown type.
pub fn type_header_len(ptype: u32, caps: &CapSet) -> Option<usize> {
    let len = match ptype {
        PKT_HELLO => HELLO_VERSION_LEN,
        PKT_DEVICE_CONNECT => {
            if caps.has(CAP_CONNECT_DEVICE_VERSION) {
                10
            } else {
                8
            }
        }
        PKT_DEVICE_DISCONNECT | PKT_RESET | PKT_GET_CONFIGURATION | PKT_CANCEL_DATA_PACKET
        | PKT_FILTER_REJECT | PKT_FILTER_FILTER | PKT_DEVICE_DISCONNECT_ACK => 0,
        PKT_INTERFACE_INFO => 4 + 4 * MAX_INTERFACES,
        PKT_EP_INFO => {
            let mut len = 3 * MAX_ENDPOINTS;
            if caps.has(CAP_EP_INFO_MAX_PACKET_SIZE) {
                len += 2 * MAX_ENDPOINTS;
            }
            if caps.has(CAP_BULK_STREAMS) {
                len += 4 * MAX_ENDPOINTS;
            }
            len
        }
        PKT_SET_CONFIGURATION => 1,
        PKT_CONFIGURATION_STATUS => 2,
        PKT_SET_ALT_SETTING => 2,
        PKT_GET_ALT_SETTING => 1,
        PKT_ALT_SETTING_STATUS => 3,
        PKT_START_ISO_STREAM => 3,
        PKT_STOP_ISO_STREAM => 1,
        PKT_ISO_STREAM_STATUS => 2,
        PKT_START_INTERRUPT_RECEIVING => 1,
        PKT_STOP_INTERRUPT_RECEIVING => 1,
        PKT_INTERRUPT_RECEIVING_STATUS => 2,
        PKT_ALLOC_BULK_STREAMS => 8,
        PKT_FREE_BULK_STREAMS => 4,
        PKT_BULK_STREAMS_STATUS => 9,
        PKT_START_BULK_RECEIVING => 10,
        PKT_STOP_BULK_RECEIVING => 5,
        PKT_BULK_RECEIVING_STATUS => 6,
        PKT_CONTROL_PACKET => 10,
        PKT_BULK_PACKET => {
            if caps.has(CAP_32BITS_BULK_LENGTH) {
                10
            } else {
                8
            }
        }
        PKT_ISO_PACKET => 4,
        PKT_INTERRUPT_PACKET => 4,
        PKT_BUFFERED_BULK_PACKET => 10,
        _ => return None,
    };
    Some(len)
}

/// Whether a packet type may carry bytes beyond its type header.
pub fn carries_payload(ptype: u32) -> bool {
    matches!(
        ptype,
        PKT_HELLO
            | PKT_FILTER_FILTER
            | PKT_CONTROL_PACKET
            | PKT_BULK_PACKET
            | PKT_ISO_PACKET
            | PKT_INTERRUPT_PACKET
            | PKT_BUFFERED_BULK_PACKET
    )
}

/// Allowed direction of travel, or `None` for an unknown type.
pub fn allowed_direction(ptype: u32) -> Option<PacketDirection> {
    use PacketDirection::*;
    let dir = match ptype {
        PKT_HELLO | PKT_FILTER_REJECT | PKT_FILTER_FILTER | PKT_CONTROL_PACKET
        | PKT_BULK_PACKET | PKT_ISO_PACKET | PKT_INTERRUPT_PACKET => Both,
        PKT_DEVICE_CONNECT
        | PKT_DEVICE_DISCONNECT
        | PKT_INTERFACE_INFO
        | PKT_EP_INFO
        | PKT_CONFIGURATION_STATUS
        | PKT_ALT_SETTING_STATUS
        | PKT_ISO_STREAM_STATUS
        | PKT_INTERRUPT_RECEIVING_STATUS
        | PKT_BULK_STREAMS_STATUS
        | PKT_BULK_RECEIVING_STATUS
        | PKT_BUFFERED_BULK_PACKET => HostToGuest,
        PKT_RESET
        | PKT_SET_CONFIGURATION
        | PKT_GET_CONFIGURATION
        | PKT_SET_ALT_SETTING
        | PKT_GET_ALT_SETTING
        | PKT_START_ISO_STREAM
        | PKT_STOP_ISO_STREAM
        | PKT_START_INTERRUPT_RECEIVING
        | PKT_STOP_INTERRUPT_RECEIVING
        | PKT_ALLOC_BULK_STREAMS
        | PKT_FREE_BULK_STREAMS
        | PKT_CANCEL_DATA_PACKET
        | PKT_DEVICE_DISCONNECT_ACK
        | PKT_START_BULK_RECEIVING
        | PKT_STOP_BULK_RECEIVING => GuestToHost,
        _ => return None,
    };
    Some(dir)
}

/// True when a packet travelling `from_host` is legal for its type.
pub fn direction_ok(ptype: u32, from_host: bool) -> bool {
    match allowed_direction(ptype) {
        Some(PacketDirection::Both) => true,
        Some(PacketDirection::HostToGuest) => from_host,
        Some(PacketDirection::GuestToHost) => !from_host,
        None => false,
    }
}

#[inline]
fn get_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

#[inline]
fn get_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl Packet {
    pub fn type_id(&self) -> u32 {
        match self {
            Packet::Hello(_) => PKT_HELLO,
            Packet::DeviceConnect(_) => PKT_DEVICE_CONNECT,
            Packet::DeviceDisconnect => PKT_DEVICE_DISCONNECT,
            Packet::Reset => PKT_RESET,
            Packet::InterfaceInfo(_) => PKT_INTERFACE_INFO,
            Packet::EpInfo(_) => PKT_EP_INFO,
            Packet::SetConfiguration(_) => PKT_SET_CONFIGURATION,
            Packet::GetConfiguration => PKT_GET_CONFIGURATION,
            Packet::ConfigurationStatus(_) => PKT_CONFIGURATION_STATUS,
            Packet::SetAltSetting(_) => PKT_SET_ALT_SETTING,
            Packet::GetAltSetting(_) => PKT_GET_ALT_SETTING,
            Packet::AltSettingStatus(_) => PKT_ALT_SETTING_STATUS,
            Packet::StartIsoStream(_) => PKT_START_ISO_STREAM,
            Packet::StopIsoStream(_) => PKT_STOP_ISO_STREAM,
            Packet::IsoStreamStatus(_) => PKT_ISO_STREAM_STATUS,
            Packet::StartInterruptReceiving(_) => PKT_START_INTERRUPT_RECEIVING,
            Packet::StopInterruptReceiving(_) => PKT_STOP_INTERRUPT_RECEIVING,
            Packet::InterruptReceivingStatus(_) => PKT_INTERRUPT_RECEIVING_STATUS,
            Packet::AllocBulkStreams(_) => PKT_ALLOC_BULK_STREAMS,
            Packet::FreeBulkStreams(_) => PKT_FREE_BULK_STREAMS,
            Packet::BulkStreamsStatus(_) => PKT_BULK_STREAMS_STATUS,
            Packet::CancelDataPacket => PKT_CANCEL_DATA_PACKET,
            Packet::FilterReject => PKT_FILTER_REJECT,
            Packet::FilterFilter => PKT_FILTER_FILTER,
            Packet::DeviceDisconnectAck => PKT_DEVICE_DISCONNECT_ACK,
            Packet::StartBulkReceiving(_) => PKT_START_BULK_RECEIVING,
            Packet::StopBulkReceiving(_) => PKT_STOP_BULK_RECEIVING,
            Packet::BulkReceivingStatus(_) => PKT_BULK_RECEIVING_STATUS,
            Packet::ControlPacket(_) => PKT_CONTROL_PACKET,
            Packet::BulkPacket(_) => PKT_BULK_PACKET,
            Packet::IsoPacket(_) => PKT_ISO_PACKET,
            Packet::InterruptPacket(_) => PKT_INTERRUPT_PACKET,
            Packet::BufferedBulkPacket(_) => PKT_BUFFERED_BULK_PACKET,
        }
    }

    /// Serialize the type header under `caps`. The output length is exactly
    /// `type_header_len(self.type_id(), caps)`.
    pub fn encode_type_header(&self, caps: &CapSet, out: &mut Vec<u8>) {
        match self {
            Packet::Hello(h) => out.extend_from_slice(&h.version),
            Packet::DeviceConnect(h) => {
                out.push(h.speed);
                out.push(h.device_class);
                out.push(h.device_subclass);
                out.push(h.device_protocol);
                out.extend_from_slice(&h.vendor_id.to_le_bytes());
                out.extend_from_slice(&h.product_id.to_le_bytes());
                if caps.has(CAP_CONNECT_DEVICE_VERSION) {
                    out.extend_from_slice(&h.device_version_bcd.to_le_bytes());
                }
            }
            Packet::DeviceDisconnect
            | Packet::Reset
            | Packet::GetConfiguration
            | Packet::CancelDataPacket
            | Packet::FilterReject
            | Packet::FilterFilter
            | Packet::DeviceDisconnectAck => {}
            Packet::InterfaceInfo(h) => {
                out.extend_from_slice(&h.interface_count.to_le_bytes());
                out.extend_from_slice(&h.interface);
                out.extend_from_slice(&h.interface_class);
                out.extend_from_slice(&h.interface_subclass);
                out.extend_from_slice(&h.interface_protocol);
            }
            Packet::EpInfo(h) => {
                out.extend_from_slice(&h.ep_type);
                out.extend_from_slice(&h.interval);
                out.extend_from_slice(&h.interface);
                if caps.has(CAP_EP_INFO_MAX_PACKET_SIZE) {
                    for mps in h.max_packet_size {
                        out.extend_from_slice(&mps.to_le_bytes());
                    }
                }
                if caps.has(CAP_BULK_STREAMS) {
                    for ms in h.max_streams {
                        out.extend_from_slice(&ms.to_le_bytes());
                    }
                }
            }
            Packet::SetConfiguration(h) => out.push(h.configuration),
            Packet::ConfigurationStatus(h) => {
                out.push(h.status);
                out.push(h.configuration);
            }
            Packet::SetAltSetting(h) => {
                out.push(h.interface);
                out.push(h.alt);
            }
            Packet::GetAltSetting(h) => out.push(h.interface),
            Packet::AltSettingStatus(h) => {
                out.push(h.status);
                out.push(h.interface);
                out.push(h.alt);
            }
            Packet::StartIsoStream(h) => {
                out.push(h.endpoint);
                out.push(h.pkts_per_urb);
                out.push(h.no_urbs);
            }
            Packet::StopIsoStream(h) => out.push(h.endpoint),
            Packet::IsoStreamStatus(h) => {
                out.push(h.status);
                out.push(h.endpoint);
            }
            Packet::StartInterruptReceiving(h) => out.push(h.endpoint),
            Packet::StopInterruptReceiving(h) => out.push(h.endpoint),
            Packet::InterruptReceivingStatus(h) => {
                out.push(h.status);
                out.push(h.endpoint);
            }
            Packet::AllocBulkStreams(h) => {
                out.extend_from_slice(&h.endpoints.to_le_bytes());
                out.extend_from_slice(&h.no_streams.to_le_bytes());
            }
            Packet::FreeBulkStreams(h) => out.extend_from_slice(&h.endpoints.to_le_bytes()),
            Packet::BulkStreamsStatus(h) => {
                out.extend_from_slice(&h.endpoints.to_le_bytes());
                out.extend_from_slice(&h.no_streams.to_le_bytes());
                out.push(h.status);
            }
            Packet::StartBulkReceiving(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.extend_from_slice(&h.bytes_per_transfer.to_le_bytes());
                out.push(h.endpoint);
                out.push(h.no_transfers);
            }
            Packet::StopBulkReceiving(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.push(h.endpoint);
            }
            Packet::BulkReceivingStatus(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.push(h.endpoint);
                out.push(h.status);
            }
            Packet::ControlPacket(h) => {
                out.push(h.endpoint);
                out.push(h.request);
                out.push(h.requesttype);
                out.push(h.status);
                out.extend_from_slice(&h.value.to_le_bytes());
                out.extend_from_slice(&h.index.to_le_bytes());
                out.extend_from_slice(&h.length.to_le_bytes());
            }
            Packet::BulkPacket(h) => {
                out.push(h.endpoint);
                out.push(h.status);
                out.extend_from_slice(&h.length.to_le_bytes());
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                if caps.has(CAP_32BITS_BULK_LENGTH) {
                    out.extend_from_slice(&h.length_high.to_le_bytes());
                }
            }
            Packet::IsoPacket(h) => {
                out.push(h.endpoint);
                out.push(h.status);
                out.extend_from_slice(&h.length.to_le_bytes());
            }
            Packet::InterruptPacket(h) => {
                out.push(h.endpoint);
                out.push(h.status);
                out.extend_from_slice(&h.length.to_le_bytes());
            }
            Packet::BufferedBulkPacket(h) => {
                out.extend_from_slice(&h.stream_id.to_le_bytes());
                out.extend_from_slice(&h.length.to_le_bytes());
                out.push(h.endpoint);
                out.push(h.status);
            }
        }
    }

    /// Decode a type header. `bytes` must be exactly
    /// `type_header_len(ptype, caps)` long, which the framing loop guarantees.
    pub fn decode_type_header(ptype: u32, caps: &CapSet, bytes: &[u8]) -> Option<Packet> {
        let pkt = match ptype {
            PKT_HELLO => {
                let mut version = [0u8; HELLO_VERSION_LEN];
                version.copy_from_slice(&bytes[..HELLO_VERSION_LEN]);
                Packet::Hello(HelloHeader { version })
            }
            PKT_DEVICE_CONNECT => {
                let mut h = DeviceConnectHeader {
                    speed: bytes[0],
                    device_class: bytes[1],
                    device_subclass: bytes[2],
                    device_protocol: bytes[3],
                    vendor_id: get_u16(bytes, 4),
                    product_id: get_u16(bytes, 6),
                    device_version_bcd: 0,
                };
                if caps.has(CAP_CONNECT_DEVICE_VERSION) {
                    h.device_version_bcd = get_u16(bytes, 8);
                }
                Packet::DeviceConnect(h)
            }
            PKT_DEVICE_DISCONNECT => Packet::DeviceDisconnect,
            PKT_RESET => Packet::Reset,
            PKT_INTERFACE_INFO => {
                let mut h = InterfaceInfoHeader {
                    interface_count: get_u32(bytes, 0),
                    ..Default::default()
                };
                h.interface.copy_from_slice(&bytes[4..36]);
                h.interface_class.copy_from_slice(&bytes[36..68]);
                h.interface_subclass.copy_from_slice(&bytes[68..100]);
                h.interface_protocol.copy_from_slice(&bytes[100..132]);
                Packet::InterfaceInfo(h)
            }
            PKT_EP_INFO => {
                let mut h = EpInfoHeader::default();
                h.ep_type.copy_from_slice(&bytes[0..32]);
                h.interval.copy_from_slice(&bytes[32..64]);
                h.interface.copy_from_slice(&bytes[64..96]);
                let mut off = 96;
                if caps.has(CAP_EP_INFO_MAX_PACKET_SIZE) {
                    for i in 0..MAX_ENDPOINTS {
                        h.max_packet_size[i] = get_u16(bytes, off + 2 * i);
                    }
                    off += 2 * MAX_ENDPOINTS;
                }
                if caps.has(CAP_BULK_STREAMS) {
                    for i in 0..MAX_ENDPOINTS {
                        h.max_streams[i] = get_u32(bytes, off + 4 * i);
                    }
                }
                Packet::EpInfo(h)
            }
            PKT_SET_CONFIGURATION => Packet::SetConfiguration(SetConfigurationHeader {
                configuration: bytes[0],
            }),
            PKT_GET_CONFIGURATION => Packet::GetConfiguration,
            PKT_CONFIGURATION_STATUS => Packet::ConfigurationStatus(ConfigurationStatusHeader {
                status: bytes[0],
                configuration: bytes[1],
            }),
            PKT_SET_ALT_SETTING => Packet::SetAltSetting(SetAltSettingHeader {
                interface: bytes[0],
                alt: bytes[1],
            }),
            PKT_GET_ALT_SETTING => Packet::GetAltSetting(GetAltSettingHeader {
                interface: bytes[0],
            }),
            PKT_ALT_SETTING_STATUS => Packet::AltSettingStatus(AltSettingStatusHeader {
                status: bytes[0],
                interface: bytes[1],
                alt: bytes[2],
            }),
            PKT_START_ISO_STREAM => Packet::StartIsoStream(StartIsoStreamHeader {
                endpoint: bytes[0],
                pkts_per_urb: bytes[1],
                no_urbs: bytes[2],
            }),
            PKT_STOP_ISO_STREAM => Packet::StopIsoStream(StopIsoStreamHeader {
                endpoint: bytes[0],
            }),
            PKT_ISO_STREAM_STATUS => Packet::IsoStreamStatus(IsoStreamStatusHeader {
                status: bytes[0],
                endpoint: bytes[1],
            }),
            PKT_START_INTERRUPT_RECEIVING => {
                Packet::StartInterruptReceiving(StartInterruptReceivingHeader {
                    endpoint: bytes[0],
                })
            }
            PKT_STOP_INTERRUPT_RECEIVING => {
                Packet::StopInterruptReceiving(StopInterruptReceivingHeader {
                    endpoint: bytes[0],
                })
            }
            PKT_INTERRUPT_RECEIVING_STATUS => {
                Packet::InterruptReceivingStatus(InterruptReceivingStatusHeader {
                    status: bytes[0],
                    endpoint: bytes[1],
                })
            }
            PKT_ALLOC_BULK_STREAMS => Packet::AllocBulkStreams(AllocBulkStreamsHeader {
                endpoints: get_u32(bytes, 0),
                no_streams: get_u32(bytes, 4),
            }),
            PKT_FREE_BULK_STREAMS => Packet::FreeBulkStreams(FreeBulkStreamsHeader {
                endpoints: get_u32(bytes, 0),
            }),
            PKT_BULK_STREAMS_STATUS => Packet::BulkStreamsStatus(BulkStreamsStatusHeader {
                endpoints: get_u32(bytes, 0),
                no_streams: get_u32(bytes, 4),
                status: bytes[8],
            }),
            PKT_CANCEL_DATA_PACKET => Packet::CancelDataPacket,
            PKT_FILTER_REJECT => Packet::FilterReject,
            PKT_FILTER_FILTER => Packet::FilterFilter,
            PKT_DEVICE_DISCONNECT_ACK => Packet::DeviceDisconnectAck,
            PKT_START_BULK_RECEIVING => Packet::StartBulkReceiving(StartBulkReceivingHeader {
                stream_id: get_u32(bytes, 0),
                bytes_per_transfer: get_u32(bytes, 4),
                endpoint: bytes[8],
                no_transfers: bytes[9],
            }),
            PKT_STOP_BULK_RECEIVING => Packet::StopBulkReceiving(StopBulkReceivingHeader {
                stream_id: get_u32(bytes, 0),
                endpoint: bytes[4],
            }),
            PKT_BULK_RECEIVING_STATUS => Packet::BulkReceivingStatus(BulkReceivingStatusHeader {
                stream_id: get_u32(bytes, 0),
                endpoint: bytes[4],
                status: bytes[5],
            }),
            PKT_CONTROL_PACKET => Packet::ControlPacket(ControlPacketHeader {
                endpoint: bytes[0],
                request: bytes[1],
                requesttype: bytes[2],
                status: bytes[3],
                value: get_u16(bytes, 4),
                index: get_u16(bytes, 6),
                length: get_u16(bytes, 8),
            }),
            PKT_BULK_PACKET => {
                let mut h = BulkPacketHeader {
                    endpoint: bytes[0],
                    status: bytes[1],
                    length: get_u16(bytes, 2),
                    stream_id: get_u32(bytes, 4),
                    length_high: 0,
                };
                if caps.has(CAP_32BITS_BULK_LENGTH) {
                    h.length_high = get_u16(bytes, 8);
                }
                Packet::BulkPacket(h)
            }
            PKT_ISO_PACKET => Packet::IsoPacket(IsoPacketHeader {
                endpoint: bytes[0],
                status: bytes[1],
                length: get_u16(bytes, 2),
            }),
            PKT_INTERRUPT_PACKET => Packet::InterruptPacket(InterruptPacketHeader {
                endpoint: bytes[0],
                status: bytes[1],
                length: get_u16(bytes, 2),
            }),
            PKT_BUFFERED_BULK_PACKET => Packet::BufferedBulkPacket(BufferedBulkPacketHeader {
                stream_id: get_u32(bytes, 0),
                length: get_u32(bytes, 4),
                endpoint: bytes[8],
                status: bytes[9],
            }),
            _ => return None,
        };
        Some(pkt)
    }
}

/// Semantic validation applied to every packet, sent or received.
///
/// `from_host` is the direction the packet travels (true = device side to
/// guest side); payload-direction rules depend on it.
pub fn check_packet(pkt: &Packet, data_len: usize, caps: &CapSet, from_host: bool) -> PacketCheck {
    use PacketCheck::*;

    match pkt {
        Packet::Hello(_) => {
            if data_len % 4 != 0 {
                return Invalid("hello capability array not a whole number of words");
            }
        }
        Packet::InterfaceInfo(h) => {
            if h.interface_count as usize > MAX_INTERFACES {
                return Invalid("interface_info with more than 32 interfaces");
            }
        }
        Packet::StartInterruptReceiving(h) => {
            if !ep_is_input(h.endpoint) {
                return Invalid("start_interrupt_receiving on non-input endpoint");
            }
        }
        Packet::StopInterruptReceiving(h) => {
            if !ep_is_input(h.endpoint) {
                return Invalid("stop_interrupt_receiving on non-input endpoint");
            }
        }
        Packet::InterruptReceivingStatus(h) => {
            if !ep_is_input(h.endpoint) {
                return Invalid("interrupt_receiving_status on non-input endpoint");
            }
        }
        Packet::AllocBulkStreams(_) | Packet::FreeBulkStreams(_) | Packet::BulkStreamsStatus(_) => {
            if !caps.has(CAP_BULK_STREAMS) {
                return Unsupported("bulk streams used without mutual capability");
            }
        }
        Packet::StartBulkReceiving(h) => {
            if !caps.has(CAP_BULK_RECEIVING) {
                return Unsupported("bulk receiving used without mutual capability");
            }
            if !ep_is_input(h.endpoint) {
                return Invalid("start_bulk_receiving on non-input endpoint");
            }
            if h.bytes_per_transfer as usize > MAX_BULK_TRANSFER_SIZE {
                return Invalid("start_bulk_receiving bytes_per_transfer too large");
            }
        }
        Packet::StopBulkReceiving(h) => {
            if !caps.has(CAP_BULK_RECEIVING) {
                return Unsupported("bulk receiving used without mutual capability");
            }
            if !ep_is_input(h.endpoint) {
                return Invalid("stop_bulk_receiving on non-input endpoint");
            }
        }
        Packet::BulkReceivingStatus(h) => {
            if !caps.has(CAP_BULK_RECEIVING) {
                return Unsupported("bulk receiving used without mutual capability");
            }
            if !ep_is_input(h.endpoint) {
                return Invalid("bulk_receiving_status on non-input endpoint");
            }
        }
        Packet::FilterFilter => {
            if data_len == 0 {
                return Invalid("filter_filter without a filter string");
            }
        }
        Packet::ControlPacket(h) => {
            if data_len > 0 {
                if ep_is_input(h.endpoint) != from_host {
                    return Invalid("control_packet payload travelling against endpoint direction");
                }
                if data_len != h.length as usize {
                    return Invalid("control_packet payload length mismatch");
                }
            }
        }
        Packet::BulkPacket(h) => {
            let total = h.total_length();
            if total > MAX_BULK_TRANSFER_SIZE {
                return Invalid("bulk_packet length too large");
            }
            if data_len > 0 {
                if ep_is_input(h.endpoint) != from_host {
                    return Invalid("bulk_packet payload travelling against endpoint direction");
                }
                if data_len != total {
                    return Invalid("bulk_packet payload length mismatch");
                }
            }
        }
        Packet::IsoPacket(h) => {
            if ep_is_input(h.endpoint) != from_host {
                return Invalid("iso_packet travelling against endpoint direction");
            }
            if data_len != h.length as usize {
                return Invalid("iso_packet payload length mismatch");
            }
        }
        Packet::InterruptPacket(h) => {
            if ep_is_input(h.endpoint) {
                if !from_host {
                    return Invalid("interrupt_packet for input endpoint sent by guest");
                }
                if data_len != h.length as usize {
                    return Invalid("interrupt_packet payload length mismatch");
                }
            } else if from_host {
                // Write-completion echo carries no payload.
                if data_len != 0 {
                    return Invalid("interrupt_packet write status with payload");
                }
            } else if data_len != h.length as usize {
                return Invalid("interrupt_packet payload length mismatch");
            }
        }
        Packet::BufferedBulkPacket(h) => {
            if !caps.has(CAP_BULK_RECEIVING) {
                return Unsupported("buffered_bulk_packet without mutual bulk_receiving");
            }
            if h.length as usize > MAX_BULK_TRANSFER_SIZE {
                return Invalid("buffered_bulk_packet length too large");
            }
            if data_len != h.length as usize {
                return Invalid("buffered_bulk_packet payload length mismatch");
            }
        }
        _ => {}
    }
    PacketCheck::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::*;

    fn caps(bits: &[u32]) -> CapSet {
        CapSet::from_bits(bits)
    }

    #[test]
    fn type_header_sizes_follow_caps() {
        let none = caps(&[]);
        let full = caps(&[
            CAP_CONNECT_DEVICE_VERSION,
            CAP_EP_INFO_MAX_PACKET_SIZE,
            CAP_BULK_STREAMS,
            CAP_32BITS_BULK_LENGTH,
        ]);
        assert_eq!(type_header_len(PKT_DEVICE_CONNECT, &none), Some(8));
        assert_eq!(type_header_len(PKT_DEVICE_CONNECT, &full), Some(10));
        assert_eq!(type_header_len(PKT_EP_INFO, &none), Some(96));
        assert_eq!(
            type_header_len(PKT_EP_INFO, &caps(&[CAP_EP_INFO_MAX_PACKET_SIZE])),
            Some(160)
        );
        assert_eq!(type_header_len(PKT_EP_INFO, &full), Some(288));
        assert_eq!(type_header_len(PKT_BULK_PACKET, &none), Some(8));
        assert_eq!(type_header_len(PKT_BULK_PACKET, &full), Some(10));
        assert_eq!(type_header_len(PKT_INTERFACE_INFO, &none), Some(132));
        assert_eq!(type_header_len(PKT_CONTROL_PACKET, &none), Some(10));
        assert_eq!(type_header_len(0x7fff_ffff, &none), None);
    }

    #[test]
    fn encode_decode_round_trip() {
        let full = caps(&[
            CAP_CONNECT_DEVICE_VERSION,
            CAP_EP_INFO_MAX_PACKET_SIZE,
            CAP_BULK_STREAMS,
            CAP_32BITS_BULK_LENGTH,
        ]);
        let mut ep = EpInfoHeader::default();
        ep.ep_type[ep_index(0x81)] = EP_TYPE_BULK;
        ep.max_packet_size[ep_index(0x81)] = 512;
        ep.max_streams[ep_index(0x81)] = 4;
        let packets = vec![
            Packet::DeviceConnect(DeviceConnectHeader {
                speed: SPEED_HIGH,
                device_class: 0,
                device_subclass: 0,
                device_protocol: 0,
                vendor_id: 0x1d50,
                product_id: 0x606f,
                device_version_bcd: 0x0102,
            }),
            Packet::EpInfo(ep),
            Packet::BulkPacket(BulkPacketHeader {
                endpoint: 0x81,
                status: STATUS_SUCCESS,
                length: 0x1234,
                stream_id: 7,
                length_high: 0x2,
            }),
            Packet::ControlPacket(ControlPacketHeader {
                endpoint: 0x80,
                request: 6,
                requesttype: 0x80,
                status: STATUS_SUCCESS,
                value: 0x0100,
                index: 0,
                length: 18,
            }),
            Packet::Reset,
        ];
        for pkt in packets {
            let mut buf = Vec::new();
            pkt.encode_type_header(&full, &mut buf);
            assert_eq!(buf.len(), type_header_len(pkt.type_id(), &full).unwrap());
            let back = Packet::decode_type_header(pkt.type_id(), &full, &buf).unwrap();
            assert_eq!(back, pkt);
        }
    }

    #[test]
    fn bulk_length_high_masked_without_cap() {
        let none = caps(&[]);
        let pkt = Packet::BulkPacket(BulkPacketHeader {
            endpoint: 0x01,
            status: STATUS_SUCCESS,
            length: 10,
            stream_id: 0,
            length_high: 0xffff,
        });
        let mut buf = Vec::new();
        pkt.encode_type_header(&none, &mut buf);
        assert_eq!(buf.len(), 8);
        let back = Packet::decode_type_header(PKT_BULK_PACKET, &none, &buf).unwrap();
        match back {
            Packet::BulkPacket(h) => assert_eq!(h.length_high, 0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn interface_count_boundary() {
        let none = caps(&[]);
        let mut h = InterfaceInfoHeader::default();
        h.interface_count = 32;
        assert_eq!(
            check_packet(&Packet::InterfaceInfo(h), 0, &none, true),
            PacketCheck::Ok
        );
        h.interface_count = 33;
        assert!(matches!(
            check_packet(&Packet::InterfaceInfo(h), 0, &none, true),
            PacketCheck::Invalid(_)
        ));
    }

    #[test]
    fn interrupt_receiving_needs_input_endpoint() {
        let none = caps(&[]);
        let pkt = Packet::StartInterruptReceiving(StartInterruptReceivingHeader {
            endpoint: 0x02,
        });
        assert!(matches!(
            check_packet(&pkt, 0, &none, false),
            PacketCheck::Invalid(_)
        ));
        let pkt = Packet::StartInterruptReceiving(StartInterruptReceivingHeader {
            endpoint: 0x82,
        });
        assert_eq!(check_packet(&pkt, 0, &none, false), PacketCheck::Ok);
    }

    #[test]
    fn bulk_receiving_requires_capability() {
        let none = caps(&[]);
        let has = caps(&[CAP_BULK_RECEIVING]);
        let pkt = Packet::StartBulkReceiving(StartBulkReceivingHeader {
            stream_id: 1,
            bytes_per_transfer: 4096,
            endpoint: 0x81,
            no_transfers: 2,
        });
        assert!(matches!(
            check_packet(&pkt, 0, &none, false),
            PacketCheck::Unsupported(_)
        ));
        assert_eq!(check_packet(&pkt, 0, &has, false), PacketCheck::Ok);

        let pkt = Packet::StartBulkReceiving(StartBulkReceivingHeader {
            stream_id: 1,
            bytes_per_transfer: MAX_BULK_TRANSFER_SIZE as u32,
            endpoint: 0x81,
            no_transfers: 2,
        });
        assert_eq!(check_packet(&pkt, 0, &has, false), PacketCheck::Ok);
        let pkt = Packet::StartBulkReceiving(StartBulkReceivingHeader {
            stream_id: 1,
            bytes_per_transfer: MAX_BULK_TRANSFER_SIZE as u32 + 1,
            endpoint: 0x81,
            no_transfers: 2,
        });
        assert!(matches!(
            check_packet(&pkt, 0, &has, false),
            PacketCheck::Invalid(_)
        ));
    }

    #[test]
    fn iso_packet_direction_rules() {
        let none = caps(&[]);
        let inp = Packet::IsoPacket(IsoPacketHeader {
            endpoint: 0x81,
            status: STATUS_SUCCESS,
            length: 4,
        });
        // Input endpoint data flows host to guest only.
        assert_eq!(check_packet(&inp, 4, &none, true), PacketCheck::Ok);
        assert!(matches!(
            check_packet(&inp, 4, &none, false),
            PacketCheck::Invalid(_)
        ));

        let out = Packet::IsoPacket(IsoPacketHeader {
            endpoint: 0x02,
            status: STATUS_SUCCESS,
            length: 4,
        });
        assert_eq!(check_packet(&out, 4, &none, false), PacketCheck::Ok);
        assert!(matches!(
            check_packet(&out, 4, &none, true),
            PacketCheck::Invalid(_)
        ));
    }

    #[test]
    fn interrupt_write_echo_has_no_payload() {
        let none = caps(&[]);
        let echo = Packet::InterruptPacket(InterruptPacketHeader {
            endpoint: 0x02,
            status: STATUS_SUCCESS,
            length: 8,
        });
        // Host-side completion echo: header only.
        assert_eq!(check_packet(&echo, 0, &none, true), PacketCheck::Ok);
        assert!(matches!(
            check_packet(&echo, 8, &none, true),
            PacketCheck::Invalid(_)
        ));
        // Guest write carries the payload.
        assert_eq!(check_packet(&echo, 8, &none, false), PacketCheck::Ok);
    }

    #[test]
    fn direction_table() {
        assert!(direction_ok(PKT_DEVICE_CONNECT, true));
        assert!(!direction_ok(PKT_DEVICE_CONNECT, false));
        assert!(direction_ok(PKT_RESET, false));
        assert!(!direction_ok(PKT_RESET, true));
        assert!(direction_ok(PKT_HELLO, true));
        assert!(direction_ok(PKT_HELLO, false));
        assert!(!direction_ok(0xdead, true));
    }

    #[test]
    fn hello_version_string() {
        let h = HelloHeader::new("usbredir 0.1.0");
        assert_eq!(h.version_str(), "usbredir 0.1.0");
    }
}
