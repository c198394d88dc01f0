//! Wire-level constants for the usb-redirection protocol.
//!
//! All values are fixed by the existing wire format; integers travel
//! little-endian and structures are packed.

//
// Packet types (control)
//
pub const PKT_HELLO: u32 = 0;
pub const PKT_DEVICE_CONNECT: u32 = 1;
pub const PKT_DEVICE_DISCONNECT: u32 = 2;
pub const PKT_RESET: u32 = 3;
pub const PKT_INTERFACE_INFO: u32 = 4;
pub const PKT_EP_INFO: u32 = 5;
pub const PKT_SET_CONFIGURATION: u32 = 6;
pub const PKT_GET_CONFIGURATION: u32 = 7;
pub const PKT_CONFIGURATION_STATUS: u32 = 8;
pub const PKT_SET_ALT_SETTING: u32 = 9;
pub const PKT_GET_ALT_SETTING: u32 = 10;
pub const PKT_ALT_SETTING_STATUS: u32 = 11;
pub const PKT_START_ISO_STREAM: u32 = 12;
pub const PKT_STOP_ISO_STREAM: u32 = 13;
pub const PKT_ISO_STREAM_STATUS: u32 = 14;
pub const PKT_START_INTERRUPT_RECEIVING: u32 = 15;
pub const PKT_STOP_INTERRUPT_RECEIVING: u32 = 16;
pub const PKT_INTERRUPT_RECEIVING_STATUS: u32 = 17;
pub const PKT_ALLOC_BULK_STREAMS: u32 = 18;
pub const PKT_FREE_BULK_STREAMS: u32 = 19;
pub const PKT_BULK_STREAMS_STATUS: u32 = 20;
pub const PKT_CANCEL_DATA_PACKET: u32 = 21;
pub const PKT_FILTER_REJECT: u32 = 22;
pub const PKT_FILTER_FILTER: u32 = 23;
pub const PKT_DEVICE_DISCONNECT_ACK: u32 = 24;
pub const PKT_START_BULK_RECEIVING: u32 = 25;
pub const PKT_STOP_BULK_RECEIVING: u32 = 26;
pub const PKT_BULK_RECEIVING_STATUS: u32 = 27;

//
// Packet types (data)
//
pub const PKT_CONTROL_PACKET: u32 = 100;
pub const PKT_BULK_PACKET: u32 = 101;
pub const PKT_ISO_PACKET: u32 = 102;
pub const PKT_INTERRUPT_PACKET: u32 = 103;
pub const PKT_BUFFERED_BULK_PACKET: u32 = 104;

//
// Capability bits
//
pub const CAP_BULK_STREAMS: u32 = 0;
pub const CAP_CONNECT_DEVICE_VERSION: u32 = 1;
pub const CAP_FILTER: u32 = 2;
pub const CAP_DEVICE_DISCONNECT_ACK: u32 = 3;
pub const CAP_EP_INFO_MAX_PACKET_SIZE: u32 = 4;
pub const CAP_64BITS_IDS: u32 = 5;
pub const CAP_32BITS_BULK_LENGTH: u32 = 6;
pub const CAP_BULK_RECEIVING: u32 = 7;

/// Number of 32-bit words carried in a capability array on the wire.
pub const CAPS_WORDS: usize = 1;

//
// Status codes
//
pub const STATUS_SUCCESS: u8 = 0;
pub const STATUS_CANCELLED: u8 = 1;
pub const STATUS_INVAL: u8 = 2;
pub const STATUS_IOERROR: u8 = 3;
pub const STATUS_STALL: u8 = 4;
pub const STATUS_TIMEOUT: u8 = 5;
pub const STATUS_BABBLE: u8 = 6;

//
// Device speeds
//
pub const SPEED_LOW: u8 = 0;
pub const SPEED_FULL: u8 = 1;
pub const SPEED_HIGH: u8 = 2;
pub const SPEED_SUPER: u8 = 3;
pub const SPEED_UNKNOWN: u8 = 255;

//
// Endpoint types as carried in ep_info
//
pub const EP_TYPE_CONTROL: u8 = 0;
pub const EP_TYPE_ISO: u8 = 1;
pub const EP_TYPE_BULK: u8 = 2;
pub const EP_TYPE_INTERRUPT: u8 = 3;
pub const EP_TYPE_INVALID: u8 = 255;

//
// Limits
//
/// Upper bound on `header.length` (type header + payload).
pub const MAX_PACKET_SIZE: usize = 128 * 1024 * 1024 + 1024;
/// Upper bound on a single bulk or buffered-bulk transfer.
pub const MAX_BULK_TRANSFER_SIZE: usize = 128 * 1024 * 1024;
/// Endpoint slots: 16 numbers x 2 directions.
pub const MAX_ENDPOINTS: usize = 32;
pub const MAX_INTERFACES: usize = 32;
pub const MAX_PACKETS_PER_TRANSFER: usize = 32;
pub const MAX_TRANSFER_COUNT: usize = 16;

/// Direction bit of an endpoint address (set = input).
pub const EP_DIR_IN: u8 = 0x80;

/// Fold an endpoint address (number + direction bit) into a 0..31 slot index.
#[inline]
pub fn ep_index(endpoint: u8) -> usize {
    ((endpoint & 0x0f) | ((endpoint & EP_DIR_IN) >> 3)) as usize
}

/// Reassemble the endpoint address for a slot index.
#[inline]
pub fn ep_address(index: usize) -> u8 {
    ((index as u8) & 0x0f) | (((index as u8) & 0x10) << 3)
}

#[inline]
pub fn ep_is_input(endpoint: u8) -> bool {
    endpoint & EP_DIR_IN != 0
}

/// Human readable packet type for log output.
pub fn packet_type_name(ptype: u32) -> &'static str {
    match ptype {
        PKT_HELLO => "hello",
        PKT_DEVICE_CONNECT => "device_connect",
        PKT_DEVICE_DISCONNECT => "device_disconnect",
        PKT_RESET => "reset",
        PKT_INTERFACE_INFO => "interface_info",
        PKT_EP_INFO => "ep_info",
        PKT_SET_CONFIGURATION => "set_configuration",
        PKT_GET_CONFIGURATION => "get_configuration",
        PKT_CONFIGURATION_STATUS => "configuration_status",
        PKT_SET_ALT_SETTING => "set_alt_setting",
        PKT_GET_ALT_SETTING => "get_alt_setting",
        PKT_ALT_SETTING_STATUS => "alt_setting_status",
        PKT_START_ISO_STREAM => "start_iso_stream",
        PKT_STOP_ISO_STREAM => "stop_iso_stream",
        PKT_ISO_STREAM_STATUS => "iso_stream_status",
        PKT_START_INTERRUPT_RECEIVING => "start_interrupt_receiving",
        PKT_STOP_INTERRUPT_RECEIVING => "stop_interrupt_receiving",
        PKT_INTERRUPT_RECEIVING_STATUS => "interrupt_receiving_status",
        PKT_ALLOC_BULK_STREAMS => "alloc_bulk_streams",
        PKT_FREE_BULK_STREAMS => "free_bulk_streams",
        PKT_BULK_STREAMS_STATUS => "bulk_streams_status",
        PKT_CANCEL_DATA_PACKET => "cancel_data_packet",
        PKT_FILTER_REJECT => "filter_reject",
        PKT_FILTER_FILTER => "filter_filter",
        PKT_DEVICE_DISCONNECT_ACK => "device_disconnect_ack",
        PKT_START_BULK_RECEIVING => "start_bulk_receiving",
        PKT_STOP_BULK_RECEIVING => "stop_bulk_receiving",
        PKT_BULK_RECEIVING_STATUS => "bulk_receiving_status",
        PKT_CONTROL_PACKET => "control_packet",
        PKT_BULK_PACKET => "bulk_packet",
        PKT_ISO_PACKET => "iso_packet",
        PKT_INTERRUPT_PACKET => "interrupt_packet",
        PKT_BUFFERED_BULK_PACKET => "buffered_bulk_packet",
        _ => "unknown",
    }
}
