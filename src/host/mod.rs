//! Device-side transfer engine.
//!
//! Owns the parser, an opened USB device and the mapping between the wire
//! protocol's logical transfer model (one-shot packets, per-endpoint streams)
//! and the backend's asynchronous transfer primitives. Wire-side callbacks
//! run on the reader thread, native completions on the backend's event
//! thread; the two meet at the transfer lock.

pub mod backend;
pub mod libusb;

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::filter::{CheckOptions, FilterRules, InterfaceClass};
use crate::packets::*;
use crate::parser::{PacketHandler, Parser, ParserFlags, ReadError, Transport};
use crate::proto::*;

use backend::{
    DeviceSpeed, TransferHandle, TransferRequest, TransferResult, TransferStatus, UsbDevice,
};

const CTRL_TIMEOUT: Duration = Duration::from_millis(500);
const CANCEL_POLL: Duration = Duration::from_micros(2500);
const INTERRUPT_TRANSFER_COUNT: usize = 5;

/// `packet_idx` value marking a ring transfer as in flight.
const SUBMITTED_IDX: i32 = -1;

const USB_REQ_CLEAR_FEATURE: u8 = 0x01;
/// bmRequestType of a standard host-to-device endpoint request.
const CLEAR_FEATURE_REQUESTTYPE: u8 = 0x02;

/// Devices that hang when reset; reset requests are skipped for them.
const RESET_BLACKLIST: &[(u16, u16)] = &[(0x1210, 0x001c), (0x2ab6, 0x0101)];

/// Capabilities the device side announces.
const HOST_CAPS: &[u32] = &[
    CAP_BULK_STREAMS,
    CAP_CONNECT_DEVICE_VERSION,
    CAP_FILTER,
    CAP_DEVICE_DISCONNECT_ACK,
    CAP_EP_INFO_MAX_PACKET_SIZE,
    CAP_64BITS_IDS,
    CAP_32BITS_BULK_LENGTH,
    CAP_BULK_RECEIVING,
];

#[derive(Clone, Copy, Debug, Default)]
pub struct HostFlags {
    /// The transport takes ownership of each write buffer and meters its own
    /// buffering (see [`Transport::buffered_output_size`]).
    pub write_cb_owns_buffer: bool,
}

/// Error surface of [`Host::do_read`].
#[derive(Debug)]
pub enum HostReadError {
    Io(io::Error),
    /// Malformed frame; the connection survives.
    Parse,
    /// The guest's filter rejected our device.
    DeviceRejected,
    /// The device dropped off the bus or stopped responding.
    DeviceLost,
}

impl fmt::Display for HostReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostReadError::Io(e) => write!(f, "transport error: {e}"),
            HostReadError::Parse => write!(f, "protocol parse error"),
            HostReadError::DeviceRejected => write!(f, "device rejected by peer filter"),
            HostReadError::DeviceLost => write!(f, "usb device lost"),
        }
    }
}

impl std::error::Error for HostReadError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadStatus {
    DeviceRejected,
    DeviceLost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamKind {
    Iso,
    InterruptReceiving,
    BulkReceiving,
}

impl StreamKind {
    fn endpoint_type(self) -> u8 {
        match self {
            StreamKind::Iso => EP_TYPE_ISO,
            StreamKind::InterruptReceiving => EP_TYPE_INTERRUPT,
            StreamKind::BulkReceiving => EP_TYPE_BULK,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct StreamParams {
    kind: StreamKind,
    pkts_per_transfer: usize,
    transfer_count: usize,
    /// 0 means "one endpoint max packet".
    pkt_size: usize,
    send_success: bool,
    stream_id: u32,
}

struct RingSlot {
    packet_idx: i32,
    /// Output fill buffer, `pkts_per_transfer * pkt_size` bytes.
    buf: Vec<u8>,
    /// Per-packet fill lengths (output iso).
    lengths: Vec<u32>,
    handle: Option<TransferHandle>,
}

struct Stream {
    generation: u64,
    kind: StreamKind,
    pkts_per_transfer: usize,
    transfer_count: usize,
    pkt_size: usize,
    send_success: bool,
    stream_id: u32,
    /// Output streams stay unstarted until half the ring is buffered.
    started: bool,
    out_idx: usize,
    transfers: Vec<RingSlot>,
}

impl Stream {
    fn params(&self) -> StreamParams {
        StreamParams {
            kind: self.kind,
            pkts_per_transfer: self.pkts_per_transfer,
            transfer_count: self.transfer_count,
            pkt_size: self.pkt_size,
            send_success: self.send_success,
            stream_id: self.stream_id,
        }
    }
}

struct EndpointSlot {
    ep_type: u8,
    interval: u8,
    interface: u8,
    max_packet_size: u16,
    max_streams: u32,
    stream: Option<Stream>,
    drop_packets: u64,
    drop_warned: bool,
}

impl EndpointSlot {
    fn invalid() -> EndpointSlot {
        EndpointSlot {
            ep_type: EP_TYPE_INVALID,
            interval: 0,
            interface: 0,
            max_packet_size: 0,
            max_streams: 0,
            stream: None,
            drop_packets: 0,
            drop_warned: false,
        }
    }
}

#[derive(Clone, Copy)]
enum OneShotKind {
    Control(ControlPacketHeader),
    Bulk(BulkPacketHeader),
    Interrupt(InterruptPacketHeader),
}

struct OneShot {
    id: u64,
    seq: u64,
    kind: OneShotKind,
    handle: Option<TransferHandle>,
    cancelled: bool,
}

#[derive(Default)]
struct Threshold {
    lower: usize,
    higher: usize,
    dropping: bool,
}

struct TransferTable {
    endpoints: [EndpointSlot; MAX_ENDPOINTS],
    oneshots: Vec<OneShot>,
    cancels_pending: usize,
    iso_threshold: Threshold,
    /// Bumped per stream allocation; stale ring completions are ignored.
    next_generation: u64,
    next_seq: u64,
    /// Set after connect and a successful reset, cleared on any submission,
    /// so a reset while nothing happened can be detected as a no-op.
    reset_latch: bool,
}

impl TransferTable {
    fn new() -> TransferTable {
        TransferTable {
            endpoints: std::array::from_fn(|_| EndpointSlot::invalid()),
            oneshots: Vec::new(),
            cancels_pending: 0,
            iso_threshold: Threshold::default(),
            next_generation: 0,
            next_seq: 0,
            reset_latch: false,
        }
    }

    fn uncancel(&mut self) {
        self.cancels_pending = self.cancels_pending.saturating_sub(1);
    }
}

#[derive(Default)]
struct DeviceState {
    dev: Option<Arc<dyn UsbDevice>>,
    desc: backend::DeviceDescriptor,
    config: Option<backend::ConfigDescriptor>,
    claimed: Vec<u8>,
    /// Indexed by position in the active config's interface table.
    alt_settings: [u8; MAX_INTERFACES],
    /// Configuration the device had when we first claimed it, put back at
    /// release.
    restore_config: Option<u8>,
    quirk_skip_reset: bool,
}

#[derive(Default)]
struct DisconnectState {
    disconnected: bool,
    /// Peer supports disconnect acks and one is outstanding; no
    /// `device_connect` may be sent until it arrives.
    wait_disconnect: bool,
    connect_pending: bool,
}

struct HostInner {
    weak: Weak<HostInner>,
    parser: Parser,
    own_filter: Option<FilterRules>,
    guest_filter: Mutex<Option<FilterRules>>,
    // Lock order: device, then transfers, then disconnect.
    device: Mutex<DeviceState>,
    transfers: Mutex<TransferTable>,
    disco: Mutex<DisconnectState>,
    read_status: Mutex<Option<ReadStatus>>,
}

/// The device-side engine: a parser plus the machinery redirecting one USB
/// device over it.
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn new(
        transport: Box<dyn Transport>,
        version: &str,
        flags: HostFlags,
        own_filter: Option<FilterRules>,
    ) -> Host {
        let inner = Arc::new_cyclic(|weak: &Weak<HostInner>| {
            let handler = HostHandler {
                inner: weak.clone(),
            };
            let parser = Parser::new(
                Box::new(handler),
                transport,
                version,
                HOST_CAPS,
                ParserFlags {
                    usb_host: true,
                    no_hello: false,
                    write_cb_owns_buffer: flags.write_cb_owns_buffer,
                },
            );
            HostInner {
                weak: weak.clone(),
                parser,
                own_filter,
                guest_filter: Mutex::new(None),
                device: Mutex::new(DeviceState::default()),
                transfers: Mutex::new(TransferTable::new()),
                disco: Mutex::new(DisconnectState::default()),
                read_status: Mutex::new(None),
            }
        });
        Host { inner }
    }

    /// Attach a device (replacing any current one) or detach with `None`.
    /// Attaching emits `device_connect` as soon as the negotiation state
    /// allows it.
    pub fn set_device(&self, dev: Option<Arc<dyn UsbDevice>>) -> io::Result<()> {
        self.inner.set_device(dev)
    }

    pub fn do_read(&self) -> Result<(), HostReadError> {
        let res = self.inner.parser.do_read();
        if let Some(status) = self.inner.read_status.lock().unwrap().take() {
            return Err(match status {
                ReadStatus::DeviceRejected => HostReadError::DeviceRejected,
                ReadStatus::DeviceLost => HostReadError::DeviceLost,
            });
        }
        res.map_err(|e| match e {
            ReadError::Io(e) => HostReadError::Io(e),
            ReadError::Parse => HostReadError::Parse,
        })
    }

    pub fn do_write(&self) -> io::Result<()> {
        self.inner.parser.do_write()
    }

    pub fn has_data_to_write(&self) -> bool {
        self.inner.parser.has_data_to_write()
    }

    pub fn buffered_output_size(&self) -> usize {
        self.inner.parser.buffered_output_size()
    }

    pub fn parser(&self) -> &Parser {
        &self.inner.parser
    }
}

/// The parser's handler; holds a non-owning back-reference to the engine
/// that owns the parser.
struct HostHandler {
    inner: Weak<HostInner>,
}

impl HostHandler {
    fn with<F: FnOnce(&HostInner)>(&self, f: F) {
        if let Some(inner) = self.inner.upgrade() {
            f(&inner);
        }
    }
}

impl PacketHandler for HostHandler {
    fn hello(&self, _parser: &Parser, _version: &str) {
        self.with(|h| h.on_hello());
    }
    fn reset(&self, _parser: &Parser) {
        self.with(|h| h.on_reset());
    }
    fn set_configuration(&self, _parser: &Parser, id: u64, header: &SetConfigurationHeader) {
        self.with(|h| h.on_set_configuration(id, header));
    }
    fn get_configuration(&self, _parser: &Parser, id: u64) {
        self.with(|h| h.on_get_configuration(id));
    }
    fn set_alt_setting(&self, _parser: &Parser, id: u64, header: &SetAltSettingHeader) {
        self.with(|h| h.on_set_alt_setting(id, header));
    }
    fn get_alt_setting(&self, _parser: &Parser, id: u64, header: &GetAltSettingHeader) {
        self.with(|h| h.on_get_alt_setting(id, header));
    }
    fn start_iso_stream(&self, _parser: &Parser, id: u64, header: &StartIsoStreamHeader) {
        self.with(|h| h.on_start_iso_stream(id, header));
    }
    fn stop_iso_stream(&self, _parser: &Parser, id: u64, header: &StopIsoStreamHeader) {
        self.with(|h| h.on_stop_iso_stream(id, header));
    }
    fn start_interrupt_receiving(
        &self,
        _parser: &Parser,
        id: u64,
        header: &StartInterruptReceivingHeader,
    ) {
        self.with(|h| h.on_start_interrupt_receiving(id, header));
    }
    fn stop_interrupt_receiving(
        &self,
        _parser: &Parser,
        id: u64,
        header: &StopInterruptReceivingHeader,
    ) {
        self.with(|h| h.on_stop_interrupt_receiving(id, header));
    }
    fn alloc_bulk_streams(&self, _parser: &Parser, id: u64, header: &AllocBulkStreamsHeader) {
        self.with(|h| h.on_alloc_bulk_streams(id, header));
    }
    fn free_bulk_streams(&self, _parser: &Parser, id: u64, header: &FreeBulkStreamsHeader) {
        self.with(|h| h.on_free_bulk_streams(id, header));
    }
    fn cancel_data_packet(&self, _parser: &Parser, id: u64) {
        self.with(|h| h.on_cancel_data_packet(id));
    }
    fn filter_reject(&self, _parser: &Parser) {
        self.with(|h| h.set_read_status(ReadStatus::DeviceRejected));
    }
    fn filter_filter(&self, _parser: &Parser, rules: &str) {
        self.with(|h| h.on_filter_filter(rules));
    }
    fn device_disconnect_ack(&self, _parser: &Parser) {
        self.with(|h| h.on_disconnect_ack());
    }
    fn start_bulk_receiving(&self, _parser: &Parser, id: u64, header: &StartBulkReceivingHeader) {
        self.with(|h| h.on_start_bulk_receiving(id, header));
    }
    fn stop_bulk_receiving(&self, _parser: &Parser, id: u64, header: &StopBulkReceivingHeader) {
        self.with(|h| h.on_stop_bulk_receiving(id, header));
    }
    fn control_packet(
        &self,
        _parser: &Parser,
        id: u64,
        header: &ControlPacketHeader,
        data: Vec<u8>,
    ) {
        self.with(|h| h.on_control_packet(id, header, data));
    }
    fn bulk_packet(&self, _parser: &Parser, id: u64, header: &BulkPacketHeader, data: Vec<u8>) {
        self.with(|h| h.on_bulk_packet(id, header, data));
    }
    fn iso_packet(&self, _parser: &Parser, id: u64, header: &IsoPacketHeader, data: Vec<u8>) {
        self.with(|h| h.on_iso_packet(id, header, data));
    }
    fn interrupt_packet(
        &self,
        _parser: &Parser,
        id: u64,
        header: &InterruptPacketHeader,
        data: Vec<u8>,
    ) {
        self.with(|h| h.on_interrupt_packet(id, header, data));
    }
}

fn wire_speed(speed: DeviceSpeed) -> u8 {
    match speed {
        DeviceSpeed::Low => SPEED_LOW,
        DeviceSpeed::Full => SPEED_FULL,
        DeviceSpeed::High => SPEED_HIGH,
        DeviceSpeed::Super => SPEED_SUPER,
        DeviceSpeed::Unknown => SPEED_UNKNOWN,
    }
}

fn err_status(e: &io::Error) -> u8 {
    match e.kind() {
        io::ErrorKind::WouldBlock => STATUS_TIMEOUT,
        io::ErrorKind::BrokenPipe => STATUS_STALL,
        io::ErrorKind::InvalidInput => STATUS_INVAL,
        _ => STATUS_IOERROR,
    }
}

fn wire_status(status: TransferStatus) -> u8 {
    match status {
        TransferStatus::Completed => STATUS_SUCCESS,
        TransferStatus::Error => STATUS_IOERROR,
        TransferStatus::TimedOut => STATUS_TIMEOUT,
        TransferStatus::Cancelled => STATUS_CANCELLED,
        TransferStatus::Stall => STATUS_STALL,
        TransferStatus::NoDevice => STATUS_IOERROR,
        TransferStatus::Overflow => STATUS_BABBLE,
    }
}

/// Effective max packet size, unfolding high-speed multi-transaction bits.
fn effective_max_packet_size(speed: DeviceSpeed, ep_type: u8, raw: u16) -> u16 {
    if speed == DeviceSpeed::High && (ep_type == EP_TYPE_ISO || ep_type == EP_TYPE_INTERRUPT) {
        let base = raw & 0x7ff;
        let mult = 1 + ((raw >> 11) & 0x3);
        base.saturating_mul(mult)
    } else {
        raw & 0x7ff
    }
}

impl HostInner {
    fn device(&self) -> Option<Arc<dyn UsbDevice>> {
        self.device.lock().unwrap().dev.clone()
    }

    fn set_read_status(&self, status: ReadStatus) {
        let mut slot = self.read_status.lock().unwrap();
        if slot.is_none() {
            *slot = Some(status);
        }
    }

    // ---- device controller -------------------------------------------------

    fn set_device(&self, new: Option<Arc<dyn UsbDevice>>) -> io::Result<()> {
        self.detach_current();

        let Some(dev) = new else {
            return Ok(());
        };
        let desc = dev.descriptor();

        if let Some(filter) = self.guest_filter.lock().unwrap().as_ref() {
            let config = bounded_config(&dev).ok();
            if !check_filter(filter, &desc, config.as_ref()) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "device rejected by the peer's filter",
                ));
            }
        }

        let mut state = self.device.lock().unwrap();
        let mut t = self.transfers.lock().unwrap();

        state.quirk_skip_reset = RESET_BLACKLIST.contains(&(desc.vendor_id, desc.product_id));
        if state.quirk_skip_reset {
            info!(
                "device {:04x}:{:04x} is on the reset blacklist",
                desc.vendor_id, desc.product_id
            );
        }

        self.claim_device(&dev, &mut state, &mut t)?;
        state.dev = Some(dev);
        state.desc = desc;
        t.reset_latch = true;

        let mut disco = self.disco.lock().unwrap();
        disco.disconnected = false;
        disco.connect_pending = true;
        if self.parser.have_peer_caps() && !disco.wait_disconnect {
            disco.connect_pending = false;
            self.send_connect_locked(&state, &t);
        }
        Ok(())
    }

    /// Cancel everything, release the interfaces and tell the guest the
    /// device is gone.
    fn detach_current(&self) {
        let Some(dev) = self.device() else {
            return;
        };
        self.cancel_all_transfers(&dev, false);
        self.wait_for_cancel_drain(&dev);

        let mut state = self.device.lock().unwrap();
        for iface in state.claimed.clone() {
            let _ = dev.release_interface(iface);
        }
        if let (Some(restore), Some(config)) = (state.restore_config, &state.config) {
            if restore != config.value {
                let _ = dev.set_configuration(restore);
            }
        }
        state.claimed.clear();
        state.config = None;
        state.restore_config = None;
        state.dev = None;
        drop(state);

        self.handle_disconnect();
    }

    /// Read descriptors, claim every interface of the active config and
    /// rebuild the endpoint table.
    fn claim_device(
        &self,
        dev: &Arc<dyn UsbDevice>,
        state: &mut DeviceState,
        t: &mut TransferTable,
    ) -> io::Result<()> {
        dev.set_auto_detach_kernel_driver(true);
        let config = bounded_config(dev)?;

        let mut claimed = Vec::new();
        for iface in &config.interfaces {
            match dev.claim_interface(iface.number) {
                Ok(()) => claimed.push(iface.number),
                Err(e) => {
                    for c in claimed {
                        let _ = dev.release_interface(c);
                    }
                    return Err(e);
                }
            }
        }

        state.alt_settings = [0; MAX_INTERFACES];
        state.claimed = claimed;
        if state.restore_config.is_none() {
            state.restore_config = Some(config.value);
        }
        parse_endpoints(t, &config, dev.descriptor().speed);
        state.config = Some(config);
        Ok(())
    }

    fn build_interface_info(state: &DeviceState) -> InterfaceInfoHeader {
        let mut info = InterfaceInfoHeader::default();
        if let Some(config) = &state.config {
            info.interface_count = config.interfaces.len().min(MAX_INTERFACES) as u32;
            for (i, iface) in config.interfaces.iter().take(MAX_INTERFACES).enumerate() {
                info.interface[i] = iface.number;
                info.interface_class[i] = iface.class;
                info.interface_subclass[i] = iface.subclass;
                info.interface_protocol[i] = iface.protocol;
            }
        }
        info
    }

    fn build_ep_info(t: &TransferTable) -> EpInfoHeader {
        let mut info = EpInfoHeader::default();
        for (i, slot) in t.endpoints.iter().enumerate() {
            info.ep_type[i] = slot.ep_type;
            info.interval[i] = slot.interval;
            info.interface[i] = slot.interface;
            info.max_packet_size[i] = slot.max_packet_size;
            info.max_streams[i] = slot.max_streams;
        }
        info
    }

    /// Emit the current endpoint and interface layout, in that order, so the
    /// guest always sees the new layout before any status that follows.
    fn send_device_info_locked(&self, state: &DeviceState, t: &TransferTable) {
        self.parser
            .send(0, &Packet::EpInfo(Self::build_ep_info(t)), &[]);
        self.parser.send(
            0,
            &Packet::InterfaceInfo(Self::build_interface_info(state)),
            &[],
        );
    }

    fn send_connect_locked(&self, state: &DeviceState, t: &TransferTable) {
        self.send_device_info_locked(state, t);
        let d = &state.desc;
        let connect = DeviceConnectHeader {
            speed: wire_speed(d.speed),
            device_class: d.class,
            device_subclass: d.subclass,
            device_protocol: d.protocol,
            vendor_id: d.vendor_id,
            product_id: d.product_id,
            device_version_bcd: d.version_bcd,
        };
        info!(
            "connecting device {:04x}:{:04x} (speed {})",
            d.vendor_id, d.product_id, connect.speed
        );
        self.parser.send(0, &Packet::DeviceConnect(connect), &[]);
    }

    /// Emit `device_connect` if a connect is pending and nothing holds it
    /// back (peer caps known, no disconnect ack outstanding).
    fn maybe_send_connect(&self) {
        let state = self.device.lock().unwrap();
        if state.dev.is_none() {
            return;
        }
        let t = self.transfers.lock().unwrap();
        let mut disco = self.disco.lock().unwrap();
        if !disco.connect_pending || disco.wait_disconnect || !self.parser.have_peer_caps() {
            return;
        }
        disco.connect_pending = false;
        disco.disconnected = false;
        self.send_connect_locked(&state, &t);
    }

    /// Single-shot disconnect notification.
    fn handle_disconnect(&self) {
        let mut disco = self.disco.lock().unwrap();
        if disco.disconnected {
            return;
        }
        disco.disconnected = true;
        self.parser.send(0, &Packet::DeviceDisconnect, &[]);
        if self.parser.peer_has_cap(CAP_DEVICE_DISCONNECT_ACK) {
            disco.wait_disconnect = true;
        }
    }

    fn on_hello(&self) {
        if let Some(filter) = &self.own_filter {
            if self.parser.peer_has_cap(CAP_FILTER) {
                self.parser.send_filter(&filter.to_string());
            }
        }
        self.maybe_send_connect();
    }

    fn on_disconnect_ack(&self) {
        self.disco.lock().unwrap().wait_disconnect = false;
        self.maybe_send_connect();
    }

    fn on_filter_filter(&self, rules: &str) {
        let rules = match FilterRules::parse(
            rules,
            crate::filter::DEFAULT_TOKEN_SEP,
            crate::filter::DEFAULT_RULE_SEP,
        ) {
            Ok(rules) => rules,
            Err(e) => {
                warn!("ignoring malformed device filter from peer: {}", e);
                return;
            }
        };

        let rejected = {
            let state = self.device.lock().unwrap();
            match &state.dev {
                Some(_) => !check_filter(&rules, &state.desc, state.config.as_ref()),
                None => false,
            }
        };
        *self.guest_filter.lock().unwrap() = Some(rules);

        if rejected {
            info!("peer filter rejects the attached device, disconnecting it");
            self.detach_current();
        }
    }

    fn on_reset(&self) {
        let Some(dev) = self.device() else {
            return;
        };
        if self.device.lock().unwrap().quirk_skip_reset {
            info!("skipping reset, device is on the reset blacklist");
            return;
        }
        if self.transfers.lock().unwrap().reset_latch {
            debug!("reset is a no-op, nothing submitted since connect");
            return;
        }

        self.cancel_all_transfers(&dev, true);
        self.wait_for_cancel_drain(&dev);

        match dev.reset() {
            Ok(()) => {
                self.transfers.lock().unwrap().reset_latch = true;
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                self.handle_disconnect();
            }
            Err(e) => {
                error!("usb reset failed: {}, giving up on the device", e);
                self.set_read_status(ReadStatus::DeviceLost);
            }
        }
    }

    // ---- configuration and alt settings ------------------------------------

    fn on_set_configuration(&self, id: u64, h: &SetConfigurationHeader) {
        let Some(dev) = self.device() else {
            self.send_config_status(id, STATUS_IOERROR, h.configuration);
            return;
        };

        self.cancel_all_transfers(&dev, false);
        self.wait_for_cancel_drain(&dev);

        let mut state = self.device.lock().unwrap();
        let mut t = self.transfers.lock().unwrap();

        for iface in state.claimed.clone() {
            let _ = dev.release_interface(iface);
        }
        state.claimed.clear();

        let mut status = STATUS_SUCCESS;
        if let Err(e) = dev.set_configuration(h.configuration) {
            warn!("set_configuration({}) failed: {}", h.configuration, e);
            status = err_status(&e);
        }
        if let Err(e) = self.claim_device(&dev, &mut state, &mut t) {
            error!("failed to re-claim device after set_configuration: {}", e);
            state.dev = None;
            state.config = None;
            drop(t);
            drop(state);
            self.handle_disconnect();
            self.set_read_status(ReadStatus::DeviceLost);
            return;
        }
        let active = state.config.as_ref().map(|c| c.value).unwrap_or(0);

        self.send_device_info_locked(&state, &t);
        drop(t);
        drop(state);
        self.send_config_status(id, status, active);
    }

    fn on_get_configuration(&self, id: u64) {
        let state = self.device.lock().unwrap();
        let (status, value) = match (&state.dev, &state.config) {
            (Some(_), Some(config)) => (STATUS_SUCCESS, config.value),
            _ => (STATUS_IOERROR, 0),
        };
        drop(state);
        self.send_config_status(id, status, value);
    }

    fn send_config_status(&self, id: u64, status: u8, configuration: u8) {
        self.parser.send(
            id,
            &Packet::ConfigurationStatus(ConfigurationStatusHeader {
                status,
                configuration,
            }),
            &[],
        );
    }

    fn on_set_alt_setting(&self, id: u64, h: &SetAltSettingHeader) {
        let Some(dev) = self.device() else {
            self.send_alt_status(id, STATUS_IOERROR, h.interface, h.alt);
            return;
        };

        // Cancel transfers on this interface's endpoints only.
        {
            let mut t = self.transfers.lock().unwrap();
            let eps: Vec<usize> = (0..MAX_ENDPOINTS)
                .filter(|&i| {
                    t.endpoints[i].ep_type != EP_TYPE_INVALID && t.endpoints[i].interface == h.interface
                })
                .collect();
            for i in &eps {
                self.cancel_stream_locked(&mut t, &dev, *i);
            }
            let (on_iface, rest): (Vec<OneShot>, Vec<OneShot>) = t
                .oneshots
                .drain(..)
                .partition(|o| eps.contains(&ep_index(oneshot_endpoint(&o.kind))));
            t.oneshots = rest;
            let mut cancelled = 0;
            for entry in on_iface {
                if let Some(handle) = entry.handle {
                    if dev.cancel(handle).is_ok() {
                        cancelled += 1;
                    }
                }
            }
            t.cancels_pending += cancelled;
        }
        self.wait_for_cancel_drain(&dev);

        let mut state = self.device.lock().unwrap();
        let mut t = self.transfers.lock().unwrap();

        let Some(cfg_idx) = state
            .config
            .as_ref()
            .and_then(|c| c.interfaces.iter().position(|i| i.number == h.interface))
        else {
            drop(t);
            drop(state);
            self.send_alt_status(id, STATUS_INVAL, h.interface, h.alt);
            return;
        };

        let mut status = STATUS_SUCCESS;
        match dev.set_alt_setting(h.interface, h.alt) {
            Ok(()) => {
                state.alt_settings[cfg_idx] = h.alt;
            }
            Err(e) => {
                warn!("set_alt_setting({}, {}) failed: {}", h.interface, h.alt, e);
                status = err_status(&e);
            }
        }

        // Wipe and re-parse this interface's endpoints from the refreshed
        // descriptors.
        match bounded_config(&dev) {
            Ok(config) => {
                for slot in t.endpoints.iter_mut() {
                    if slot.ep_type != EP_TYPE_INVALID && slot.interface == h.interface {
                        *slot = EndpointSlot::invalid();
                    }
                }
                if let Some(iface) = config.interfaces.iter().find(|i| i.number == h.interface) {
                    parse_one_interface(&mut t, iface, dev.descriptor().speed);
                }
                state.config = Some(config);
            }
            Err(e) => {
                warn!("failed to re-read active config: {}", e);
            }
        }

        self.send_device_info_locked(&state, &t);
        drop(t);
        drop(state);
        self.send_alt_status(id, status, h.interface, h.alt);
    }

    fn on_get_alt_setting(&self, id: u64, h: &GetAltSettingHeader) {
        let state = self.device.lock().unwrap();
        let result = state
            .config
            .as_ref()
            .and_then(|c| c.interfaces.iter().position(|i| i.number == h.interface))
            .map(|idx| state.alt_settings[idx]);
        drop(state);
        match result {
            Some(alt) => self.send_alt_status(id, STATUS_SUCCESS, h.interface, alt),
            None => self.send_alt_status(id, STATUS_INVAL, h.interface, 0),
        }
    }

    fn send_alt_status(&self, id: u64, status: u8, interface: u8, alt: u8) {
        self.parser.send(
            id,
            &Packet::AltSettingStatus(AltSettingStatusHeader {
                status,
                interface,
                alt,
            }),
            &[],
        );
    }

    // ---- streams -----------------------------------------------------------

    fn on_start_iso_stream(&self, id: u64, h: &StartIsoStreamHeader) {
        let Some(dev) = self.device() else {
            self.send_stream_status(StreamKind::Iso, id, h.endpoint, 0, STATUS_IOERROR);
            return;
        };
        let input = ep_is_input(h.endpoint);
        let params = StreamParams {
            kind: StreamKind::Iso,
            pkts_per_transfer: h.pkts_per_urb as usize,
            transfer_count: h.no_urbs as usize,
            pkt_size: 0,
            // An output stream only starts pumping once half the ring is
            // buffered; claiming success at alloc would be premature.
            send_success: input,
            stream_id: 0,
        };
        let mut t = self.transfers.lock().unwrap();
        let status = self.alloc_stream(&mut t, &dev, h.endpoint, params);
        drop(t);
        if status != STATUS_SUCCESS || input {
            self.send_stream_status(StreamKind::Iso, id, h.endpoint, 0, status);
        }
    }

    fn on_stop_iso_stream(&self, id: u64, h: &StopIsoStreamHeader) {
        if let Some(dev) = self.device() {
            let mut t = self.transfers.lock().unwrap();
            self.cancel_stream_locked(&mut t, &dev, ep_index(h.endpoint));
        }
        self.send_stream_status(StreamKind::Iso, id, h.endpoint, 0, STATUS_SUCCESS);
    }

    fn on_start_interrupt_receiving(&self, id: u64, h: &StartInterruptReceivingHeader) {
        let Some(dev) = self.device() else {
            self.send_stream_status(
                StreamKind::InterruptReceiving,
                id,
                h.endpoint,
                0,
                STATUS_IOERROR,
            );
            return;
        };
        let params = StreamParams {
            kind: StreamKind::InterruptReceiving,
            pkts_per_transfer: 1,
            transfer_count: INTERRUPT_TRANSFER_COUNT,
            pkt_size: 0,
            send_success: true,
            stream_id: 0,
        };
        let mut t = self.transfers.lock().unwrap();
        let status = self.alloc_stream(&mut t, &dev, h.endpoint, params);
        drop(t);
        self.send_stream_status(StreamKind::InterruptReceiving, id, h.endpoint, 0, status);
    }

    fn on_stop_interrupt_receiving(&self, id: u64, h: &StopInterruptReceivingHeader) {
        if let Some(dev) = self.device() {
            let mut t = self.transfers.lock().unwrap();
            self.cancel_stream_locked(&mut t, &dev, ep_index(h.endpoint));
        }
        self.send_stream_status(
            StreamKind::InterruptReceiving,
            id,
            h.endpoint,
            0,
            STATUS_SUCCESS,
        );
    }

    fn on_start_bulk_receiving(&self, id: u64, h: &StartBulkReceivingHeader) {
        let Some(dev) = self.device() else {
            self.send_stream_status(
                StreamKind::BulkReceiving,
                id,
                h.endpoint,
                h.stream_id,
                STATUS_IOERROR,
            );
            return;
        };
        let params = StreamParams {
            kind: StreamKind::BulkReceiving,
            pkts_per_transfer: 1,
            transfer_count: h.no_transfers as usize,
            pkt_size: h.bytes_per_transfer as usize,
            send_success: true,
            stream_id: h.stream_id,
        };
        let mut t = self.transfers.lock().unwrap();
        let status = self.alloc_stream(&mut t, &dev, h.endpoint, params);
        drop(t);
        self.send_stream_status(StreamKind::BulkReceiving, id, h.endpoint, h.stream_id, status);
    }

    fn on_stop_bulk_receiving(&self, id: u64, h: &StopBulkReceivingHeader) {
        if let Some(dev) = self.device() {
            let mut t = self.transfers.lock().unwrap();
            self.cancel_stream_locked(&mut t, &dev, ep_index(h.endpoint));
        }
        self.send_stream_status(
            StreamKind::BulkReceiving,
            id,
            h.endpoint,
            h.stream_id,
            STATUS_SUCCESS,
        );
    }

    fn send_stream_status(&self, kind: StreamKind, id: u64, endpoint: u8, stream_id: u32, status: u8) {
        let pkt = match kind {
            StreamKind::Iso => Packet::IsoStreamStatus(IsoStreamStatusHeader { status, endpoint }),
            StreamKind::InterruptReceiving => {
                Packet::InterruptReceivingStatus(InterruptReceivingStatusHeader {
                    status,
                    endpoint,
                })
            }
            StreamKind::BulkReceiving => {
                Packet::BulkReceivingStatus(BulkReceivingStatusHeader {
                    stream_id,
                    endpoint,
                    status,
                })
            }
        };
        self.parser.send(id, &pkt, &[]);
    }

    /// The one allocator behind `start_iso_stream`,
    /// `start_interrupt_receiving` and `start_bulk_receiving`.
    fn alloc_stream(
        &self,
        t: &mut TransferTable,
        dev: &Arc<dyn UsbDevice>,
        endpoint: u8,
        params: StreamParams,
    ) -> u8 {
        let idx = ep_index(endpoint);
        let slot = &t.endpoints[idx];

        if slot.ep_type != params.kind.endpoint_type() {
            error!(
                "stream start on endpoint {:02x} whose type is {} not {}",
                endpoint,
                slot.ep_type,
                params.kind.endpoint_type()
            );
            return STATUS_INVAL;
        }
        if !(1..=MAX_PACKETS_PER_TRANSFER).contains(&params.pkts_per_transfer)
            || !(1..=MAX_TRANSFER_COUNT).contains(&params.transfer_count)
        {
            error!(
                "stream start with invalid ring dimensions {}x{}",
                params.pkts_per_transfer, params.transfer_count
            );
            return STATUS_INVAL;
        }
        let maxp = slot.max_packet_size as usize;
        if maxp == 0 {
            return STATUS_INVAL;
        }
        let pkt_size = if params.pkt_size == 0 {
            maxp
        } else {
            params.pkt_size
        };
        if pkt_size % maxp != 0 {
            error!(
                "stream packet size {} is not a multiple of max packet size {}",
                pkt_size, maxp
            );
            return STATUS_INVAL;
        }
        if slot.stream.is_some() {
            error!("endpoint {:02x} already has a stream", endpoint);
            return STATUS_INVAL;
        }

        let input = ep_is_input(endpoint);
        t.next_generation += 1;
        let generation = t.next_generation;
        let transfers = (0..params.transfer_count)
            .map(|_| RingSlot {
                packet_idx: 0,
                buf: if input {
                    Vec::new()
                } else {
                    vec![0; params.pkts_per_transfer * pkt_size]
                },
                lengths: vec![0; params.pkts_per_transfer],
                handle: None,
            })
            .collect();

        if params.kind == StreamKind::Iso {
            let reference = params.pkts_per_transfer * params.transfer_count * maxp;
            t.iso_threshold = Threshold {
                higher: 3 * reference,
                lower: reference / 2,
                dropping: false,
            };
        }

        t.endpoints[idx].stream = Some(Stream {
            generation,
            kind: params.kind,
            pkts_per_transfer: params.pkts_per_transfer,
            transfer_count: params.transfer_count,
            pkt_size,
            send_success: params.send_success,
            stream_id: params.stream_id,
            started: input,
            out_idx: 0,
            transfers,
        });

        if input {
            for j in 0..params.transfer_count {
                if let Err(e) = self.submit_ring_transfer(t, dev, idx, j) {
                    error!("failed to submit stream transfer: {}", e);
                    self.cancel_stream_locked(t, dev, idx);
                    return err_status(&e);
                }
            }
        }
        STATUS_SUCCESS
    }

    fn submit_ring_transfer(
        &self,
        t: &mut TransferTable,
        dev: &Arc<dyn UsbDevice>,
        idx: usize,
        j: usize,
    ) -> io::Result<()> {
        let endpoint = ep_address(idx);
        let stream = t.endpoints[idx].stream.as_mut().expect("stream allocated");
        let generation = stream.generation;

        let request = match stream.kind {
            StreamKind::Iso => {
                let input = ep_is_input(endpoint);
                let lengths = if input {
                    vec![stream.pkt_size as u32; stream.pkts_per_transfer]
                } else {
                    stream.transfers[j].lengths.clone()
                };
                TransferRequest::Iso {
                    endpoint,
                    num_packets: stream.pkts_per_transfer,
                    packet_len: stream.pkt_size,
                    lengths,
                    data: if input {
                        Vec::new()
                    } else {
                        std::mem::take(&mut stream.transfers[j].buf)
                    },
                }
            }
            StreamKind::InterruptReceiving => TransferRequest::Interrupt {
                endpoint,
                length: stream.pkt_size,
                data: Vec::new(),
            },
            StreamKind::BulkReceiving => TransferRequest::Bulk {
                endpoint,
                stream_id: 0,
                length: stream.pkt_size,
                data: Vec::new(),
            },
        };

        let weak = self.weak.clone();
        let dev2 = dev.clone();
        let completion = Box::new(move |result: TransferResult| {
            if let Some(inner) = weak.upgrade() {
                inner.complete_ring(&dev2, idx, j, generation, result);
            }
        });

        t.reset_latch = false;
        let handle = dev.submit(request, completion)?;
        let ring = &mut t.endpoints[idx].stream.as_mut().expect("stream").transfers[j];
        ring.handle = Some(handle);
        ring.packet_idx = SUBMITTED_IDX;
        Ok(())
    }

    /// Tear down a stream: cancel in-flight ring transfers (their completions
    /// clean up), free the rest. Returns the parameters the stream had.
    fn cancel_stream_locked(
        &self,
        t: &mut TransferTable,
        dev: &Arc<dyn UsbDevice>,
        idx: usize,
    ) -> Option<StreamParams> {
        let stream = t.endpoints[idx].stream.take()?;
        let params = stream.params();
        let mut cancelled = 0;
        for ring in &stream.transfers {
            if let Some(handle) = ring.handle {
                if dev.cancel(handle).is_ok() {
                    cancelled += 1;
                }
            }
        }
        t.cancels_pending += cancelled;
        t.endpoints[idx].drop_packets = 0;
        t.endpoints[idx].drop_warned = false;
        Some(params)
    }

    /// Isoc back-pressure: drop packets above the high-water mark, resume
    /// below the low one.
    fn can_write_iso_package(&self, t: &mut TransferTable) -> bool {
        let buffered = self.parser.buffered_output_size();
        let th = &mut t.iso_threshold;
        if th.dropping {
            if buffered < th.lower {
                th.dropping = false;
            }
        } else if th.higher > 0 && buffered > th.higher {
            th.dropping = true;
        }
        !th.dropping
    }

    fn complete_ring(
        &self,
        dev: &Arc<dyn UsbDevice>,
        idx: usize,
        j: usize,
        generation: u64,
        result: TransferResult,
    ) {
        let mut t = self.transfers.lock().unwrap();
        let current = t.endpoints[idx].stream.as_ref().map(|s| s.generation);
        if current != Some(generation) {
            // The stream was torn down while this transfer was in flight.
            t.uncancel();
            return;
        }
        {
            let stream = t.endpoints[idx].stream.as_mut().expect("stream");
            stream.transfers[j].handle = None;
        }
        let endpoint = ep_address(idx);
        let kind = t.endpoints[idx].stream.as_ref().expect("stream").kind;
        let stream_id = t.endpoints[idx].stream.as_ref().expect("stream").stream_id;

        match result.status {
            TransferStatus::NoDevice => {
                self.cancel_stream_locked(&mut t, dev, idx);
                drop(t);
                self.handle_disconnect();
                return;
            }
            TransferStatus::Cancelled => {
                // Cancelled underneath us without a stream teardown; do not
                // resubmit, the endpoint is being reconfigured.
                return;
            }
            TransferStatus::Stall => {
                let params = self
                    .cancel_stream_locked(&mut t, dev, idx)
                    .expect("stream present");
                match dev.clear_halt(endpoint) {
                    Ok(()) => {
                        let mut params = params;
                        params.send_success = false;
                        let status = self.alloc_stream(&mut t, dev, endpoint, params);
                        if status != STATUS_SUCCESS {
                            drop(t);
                            self.send_stream_status(kind, 0, endpoint, stream_id, STATUS_STALL);
                        }
                    }
                    Err(e) => {
                        warn!("clear halt failed on {:02x}: {}", endpoint, e);
                        drop(t);
                        self.send_stream_status(kind, 0, endpoint, stream_id, STATUS_STALL);
                    }
                }
                return;
            }
            _ => {}
        }

        let input = ep_is_input(endpoint);
        if !input {
            // Output iso ring slot: recycle the buffer for refilling.
            if result.status != TransferStatus::Completed {
                self.send_stream_status(kind, 0, endpoint, stream_id, wire_status(result.status));
            }
            let stream = t.endpoints[idx].stream.as_mut().expect("stream");
            let size = stream.pkts_per_transfer * stream.pkt_size;
            let ring = &mut stream.transfers[j];
            ring.packet_idx = 0;
            ring.buf = vec![0; size];
            ring.lengths.fill(0);
            return;
        }

        match result.status {
            TransferStatus::Completed => match kind {
                StreamKind::Iso => self.forward_iso_input(&mut t, idx, &result),
                StreamKind::InterruptReceiving => {
                    let len = result.data.len();
                    self.parser.send(
                        0,
                        &Packet::InterruptPacket(InterruptPacketHeader {
                            endpoint,
                            status: STATUS_SUCCESS,
                            length: len as u16,
                        }),
                        &result.data,
                    );
                }
                StreamKind::BulkReceiving => {
                    let len = result.data.len();
                    self.parser.send(
                        0,
                        &Packet::BufferedBulkPacket(BufferedBulkPacketHeader {
                            stream_id,
                            length: len as u32,
                            endpoint,
                            status: STATUS_SUCCESS,
                        }),
                        &result.data,
                    );
                }
            },
            status => {
                // Transient native error: report it and keep the stream
                // pumping.
                self.send_stream_status(kind, 0, endpoint, stream_id, wire_status(status));
            }
        }

        if let Err(e) = self.submit_ring_transfer(&mut t, dev, idx, j) {
            error!("failed to resubmit stream transfer: {}", e);
            drop(t);
            self.send_stream_status(kind, 0, endpoint, stream_id, STATUS_IOERROR);
        }
    }

    fn forward_iso_input(&self, t: &mut TransferTable, idx: usize, result: &TransferResult) {
        let endpoint = ep_address(idx);
        let (stride, pkts) = {
            let stream = t.endpoints[idx].stream.as_ref().expect("stream");
            (stream.pkt_size, stream.pkts_per_transfer)
        };
        for (i, pkt) in result.iso_packets.iter().take(pkts).enumerate() {
            if pkt.status != TransferStatus::Completed {
                self.parser.send(
                    0,
                    &Packet::IsoPacket(IsoPacketHeader {
                        endpoint,
                        status: wire_status(pkt.status),
                        length: 0,
                    }),
                    &[],
                );
                continue;
            }
            if !self.can_write_iso_package(t) {
                let slot = &mut t.endpoints[idx];
                slot.drop_packets += 1;
                if !slot.drop_warned {
                    warn!(
                        "transport cannot keep up, dropping iso packets on {:02x}",
                        endpoint
                    );
                    slot.drop_warned = true;
                }
                continue;
            }
            let slot = &mut t.endpoints[idx];
            if slot.drop_warned {
                info!(
                    "transport caught up on {:02x} after {} dropped iso packets",
                    endpoint, slot.drop_packets
                );
                slot.drop_warned = false;
                slot.drop_packets = 0;
            }
            let start = i * stride;
            let end = (start + pkt.actual).min(result.data.len());
            let data = &result.data[start..end];
            self.parser.send(
                0,
                &Packet::IsoPacket(IsoPacketHeader {
                    endpoint,
                    status: STATUS_SUCCESS,
                    length: data.len() as u16,
                }),
                data,
            );
        }
    }

    /// Guest-supplied output iso data: buffer into the ring, submit filled
    /// transfers once half the ring is primed.
    fn on_iso_packet(&self, _id: u64, h: &IsoPacketHeader, data: Vec<u8>) {
        let Some(dev) = self.device() else {
            return;
        };
        let idx = ep_index(h.endpoint);
        let mut t = self.transfers.lock().unwrap();

        let Some(stream) = t.endpoints[idx].stream.as_mut() else {
            drop(t);
            warn!("iso data for endpoint {:02x} without a stream", h.endpoint);
            self.send_stream_status(StreamKind::Iso, 0, h.endpoint, 0, STATUS_INVAL);
            return;
        };
        if stream.kind != StreamKind::Iso {
            drop(t);
            self.send_stream_status(StreamKind::Iso, 0, h.endpoint, 0, STATUS_INVAL);
            return;
        }
        if data.len() > stream.pkt_size {
            drop(t);
            self.send_stream_status(StreamKind::Iso, 0, h.endpoint, 0, STATUS_INVAL);
            return;
        }

        let out_idx = stream.out_idx;
        let pkts = stream.pkts_per_transfer;
        let pkt_size = stream.pkt_size;
        let ring = &mut stream.transfers[out_idx];
        if ring.packet_idx == SUBMITTED_IDX {
            drop(t);
            warn!(
                "guest overruns the iso ring on {:02x}, dropping packet",
                h.endpoint
            );
            return;
        }

        let pos = ring.packet_idx as usize;
        ring.buf[pos * pkt_size..pos * pkt_size + data.len()].copy_from_slice(&data);
        ring.lengths[pos] = data.len() as u32;
        ring.packet_idx += 1;

        if (ring.packet_idx as usize) < pkts {
            return;
        }
        stream.out_idx = (out_idx + 1) % stream.transfer_count;

        if stream.started {
            if let Err(e) = self.submit_ring_transfer(&mut t, &dev, idx, out_idx) {
                error!("iso output submit failed: {}", e);
                drop(t);
                self.send_stream_status(StreamKind::Iso, 0, h.endpoint, 0, STATUS_IOERROR);
            }
            return;
        }

        // Latency / underrun trade-off: wait for half the ring before the
        // first submission.
        let full: Vec<usize> = stream
            .transfers
            .iter()
            .enumerate()
            .filter(|(_, r)| r.packet_idx as usize == pkts)
            .map(|(j, _)| j)
            .collect();
        if full.len() < stream.transfer_count / 2 {
            return;
        }
        stream.started = true;
        for j in full {
            if let Err(e) = self.submit_ring_transfer(&mut t, &dev, idx, j) {
                error!("iso output submit failed: {}", e);
                drop(t);
                self.send_stream_status(StreamKind::Iso, 0, h.endpoint, 0, STATUS_IOERROR);
                return;
            }
        }
    }

    // ---- one-shot transfers ------------------------------------------------

    fn on_control_packet(&self, id: u64, h: &ControlPacketHeader, data: Vec<u8>) {
        let Some(dev) = self.device() else {
            let mut reply = *h;
            reply.status = STATUS_IOERROR;
            reply.length = 0;
            self.parser.send(id, &Packet::ControlPacket(reply), &[]);
            return;
        };

        // A clear-halt on an endpoint is not forwarded: going through the
        // native layer keeps the OS stack's stall bookkeeping coherent.
        if h.requesttype == CLEAR_FEATURE_REQUESTTYPE
            && h.request == USB_REQ_CLEAR_FEATURE
            && h.value == 0
            && h.length == 0
        {
            let status = match dev.clear_halt(h.index as u8) {
                Ok(()) => STATUS_SUCCESS,
                Err(e) => {
                    warn!("clear halt on {:02x} failed: {}", h.index, e);
                    err_status(&e)
                }
            };
            let mut reply = *h;
            reply.status = status;
            reply.length = 0;
            self.parser.send(id, &Packet::ControlPacket(reply), &[]);
            return;
        }

        let request = TransferRequest::Control {
            endpoint: h.endpoint,
            request: h.request,
            requesttype: h.requesttype,
            value: h.value,
            index: h.index,
            length: h.length,
            data,
            timeout: CTRL_TIMEOUT,
        };
        self.submit_oneshot(&dev, id, OneShotKind::Control(*h), request);
    }

    fn on_bulk_packet(&self, id: u64, h: &BulkPacketHeader, data: Vec<u8>) {
        let Some(dev) = self.device() else {
            let mut reply = *h;
            reply.status = STATUS_IOERROR;
            reply.set_total_length(0);
            self.parser.send(id, &Packet::BulkPacket(reply), &[]);
            return;
        };
        if h.stream_id != 0 && !self.parser.has_cap(CAP_BULK_STREAMS) {
            let mut reply = *h;
            reply.status = STATUS_INVAL;
            reply.set_total_length(0);
            self.parser.send(id, &Packet::BulkPacket(reply), &[]);
            return;
        }

        let request = TransferRequest::Bulk {
            endpoint: h.endpoint,
            stream_id: h.stream_id,
            length: h.total_length(),
            data,
        };
        self.submit_oneshot(&dev, id, OneShotKind::Bulk(*h), request);
    }

    fn on_interrupt_packet(&self, id: u64, h: &InterruptPacketHeader, data: Vec<u8>) {
        let Some(dev) = self.device() else {
            let mut reply = *h;
            reply.status = STATUS_IOERROR;
            reply.length = 0;
            self.parser.send(id, &Packet::InterruptPacket(reply), &[]);
            return;
        };
        let request = TransferRequest::Interrupt {
            endpoint: h.endpoint,
            length: data.len(),
            data,
        };
        self.submit_oneshot(&dev, id, OneShotKind::Interrupt(*h), request);
    }

    fn submit_oneshot(
        &self,
        dev: &Arc<dyn UsbDevice>,
        id: u64,
        kind: OneShotKind,
        request: TransferRequest,
    ) {
        let mut t = self.transfers.lock().unwrap();
        t.next_seq += 1;
        let seq = t.next_seq;
        t.oneshots.push(OneShot {
            id,
            seq,
            kind,
            handle: None,
            cancelled: false,
        });
        t.reset_latch = false;

        let weak = self.weak.clone();
        let completion = Box::new(move |result: TransferResult| {
            if let Some(inner) = weak.upgrade() {
                inner.complete_oneshot(seq, result);
            }
        });

        match dev.submit(request, completion) {
            Ok(handle) => {
                if let Some(entry) = t.oneshots.iter_mut().find(|o| o.seq == seq) {
                    entry.handle = Some(handle);
                }
            }
            Err(e) => {
                warn!("usb submit failed: {}", e);
                t.oneshots.retain(|o| o.seq != seq);
                drop(t);
                self.send_oneshot_reply(id, &kind, err_status(&e), 0, &[]);
                if e.kind() == io::ErrorKind::NotConnected {
                    self.handle_disconnect();
                }
            }
        }
    }

    fn complete_oneshot(&self, seq: u64, result: TransferResult) {
        let mut t = self.transfers.lock().unwrap();
        let Some(pos) = t.oneshots.iter().position(|o| o.seq == seq) else {
            // Silently cancelled (configuration change); nothing to report.
            t.uncancel();
            return;
        };
        let entry = t.oneshots.remove(pos);
        if entry.cancelled {
            // The cancel path already synthesised the reply; a late
            // completion, whatever its status, is discarded.
            t.uncancel();
            return;
        }
        drop(t);

        if result.status == TransferStatus::NoDevice {
            self.handle_disconnect();
        }
        let status = wire_status(result.status);
        let ok = result.status == TransferStatus::Completed;
        let data = if ok { result.data.as_slice() } else { &[] };
        let actual = if ok { result.actual } else { 0 };
        self.send_oneshot_reply(entry.id, &entry.kind, status, actual, data);
    }

    /// Build a reply echoing the original request header with updated status
    /// and length.
    fn send_oneshot_reply(&self, id: u64, kind: &OneShotKind, status: u8, actual: usize, data: &[u8]) {
        match kind {
            OneShotKind::Control(h) => {
                let mut reply = *h;
                reply.status = status;
                reply.length = actual as u16;
                let payload = if ep_is_input(h.endpoint) { data } else { &[] };
                self.parser.send(id, &Packet::ControlPacket(reply), payload);
            }
            OneShotKind::Bulk(h) => {
                let mut reply = *h;
                reply.status = status;
                reply.set_total_length(actual);
                let payload = if ep_is_input(h.endpoint) { data } else { &[] };
                self.parser.send(id, &Packet::BulkPacket(reply), payload);
            }
            OneShotKind::Interrupt(h) => {
                let mut reply = *h;
                reply.status = status;
                reply.length = actual as u16;
                // Write completion echo carries no payload.
                self.parser.send(id, &Packet::InterruptPacket(reply), &[]);
            }
        }
    }

    /// Cancel a one-shot by wire id and synthesise its `cancelled` reply
    /// immediately, so the guest sees exactly one response regardless of how
    /// the race with the native completion goes.
    fn on_cancel_data_packet(&self, id: u64) {
        let dev = self.device();
        let mut t = self.transfers.lock().unwrap();
        let found = t
            .oneshots
            .iter_mut()
            .find(|o| o.id == id && !o.cancelled)
            .map(|entry| {
                entry.cancelled = true;
                (entry.kind, entry.handle)
            });
        match found {
            Some((kind, handle)) => {
                if let (Some(handle), Some(dev)) = (handle, dev) {
                    if dev.cancel(handle).is_ok() {
                        t.cancels_pending += 1;
                    }
                }
                drop(t);
                self.send_oneshot_reply(id, &kind, STATUS_CANCELLED, 0, &[]);
            }
            None => {
                debug!("cancel for unknown data packet id {}", id);
            }
        }
    }

    // ---- bulk streams ------------------------------------------------------

    fn on_alloc_bulk_streams(&self, id: u64, h: &AllocBulkStreamsHeader) {
        let Some(dev) = self.device() else {
            self.send_bulk_streams_status(id, h.endpoints, h.no_streams, STATUS_IOERROR);
            return;
        };
        let eps = endpoints_from_mask(h.endpoints);
        let status = match dev.alloc_streams(&eps, h.no_streams) {
            Ok(allocated) if allocated >= h.no_streams => STATUS_SUCCESS,
            Ok(allocated) => {
                warn!(
                    "asked for {} bulk streams, device granted {}",
                    h.no_streams, allocated
                );
                let _ = dev.free_streams(&eps);
                STATUS_INVAL
            }
            Err(e) => {
                warn!("bulk stream allocation failed: {}", e);
                err_status(&e)
            }
        };
        self.send_bulk_streams_status(id, h.endpoints, h.no_streams, status);
    }

    fn on_free_bulk_streams(&self, id: u64, h: &FreeBulkStreamsHeader) {
        let Some(dev) = self.device() else {
            self.send_bulk_streams_status(id, h.endpoints, 0, STATUS_IOERROR);
            return;
        };
        let eps = endpoints_from_mask(h.endpoints);
        let status = match dev.free_streams(&eps) {
            Ok(()) => STATUS_SUCCESS,
            Err(e) => err_status(&e),
        };
        self.send_bulk_streams_status(id, h.endpoints, 0, status);
    }

    fn send_bulk_streams_status(&self, id: u64, endpoints: u32, no_streams: u32, status: u8) {
        self.parser.send(
            id,
            &Packet::BulkStreamsStatus(BulkStreamsStatusHeader {
                endpoints,
                no_streams,
                status,
            }),
            &[],
        );
    }

    // ---- teardown helpers --------------------------------------------------

    /// Cancel every stream and one-shot. With `notify`, streams report an
    /// adverse `stall` stop and one-shots get their `cancelled` replies; the
    /// silent variant is used around configuration changes.
    fn cancel_all_transfers(&self, dev: &Arc<dyn UsbDevice>, notify: bool) {
        let mut t = self.transfers.lock().unwrap();
        let mut stream_stops = Vec::new();
        for idx in 0..MAX_ENDPOINTS {
            if t.endpoints[idx].stream.is_some() {
                let kind = t.endpoints[idx].stream.as_ref().expect("stream").kind;
                let stream_id = t.endpoints[idx].stream.as_ref().expect("stream").stream_id;
                self.cancel_stream_locked(&mut t, dev, idx);
                if notify {
                    stream_stops.push((kind, ep_address(idx), stream_id));
                }
            }
        }
        let entries = std::mem::take(&mut t.oneshots);
        let mut cancelled = 0;
        for entry in &entries {
            if let Some(handle) = entry.handle {
                if dev.cancel(handle).is_ok() {
                    cancelled += 1;
                }
            }
        }
        t.cancels_pending += cancelled;
        drop(t);

        for (kind, endpoint, stream_id) in stream_stops {
            self.send_stream_status(kind, 0, endpoint, stream_id, STATUS_STALL);
        }
        if notify {
            for entry in &entries {
                if !entry.cancelled {
                    self.send_oneshot_reply(entry.id, &entry.kind, STATUS_CANCELLED, 0, &[]);
                }
            }
        }
    }

    /// Poll the backend until every cancellation has completed and no
    /// one-shot is left in flight.
    fn wait_for_cancel_drain(&self, dev: &Arc<dyn UsbDevice>) {
        loop {
            {
                let t = self.transfers.lock().unwrap();
                if t.cancels_pending == 0 && t.oneshots.is_empty() {
                    return;
                }
            }
            dev.poll_completions(CANCEL_POLL);
        }
    }
}

fn oneshot_endpoint(kind: &OneShotKind) -> u8 {
    match kind {
        OneShotKind::Control(h) => h.endpoint,
        OneShotKind::Bulk(h) => h.endpoint,
        OneShotKind::Interrupt(h) => h.endpoint,
    }
}

fn endpoints_from_mask(mask: u32) -> Vec<u8> {
    (0..MAX_ENDPOINTS)
        .filter(|i| mask & (1 << i) != 0)
        .map(ep_address)
        .collect()
}

/// Active config with the interface list capped at the wire protocol's 32
/// interface slots; every table indexed by config position relies on this.
fn bounded_config(dev: &Arc<dyn UsbDevice>) -> io::Result<backend::ConfigDescriptor> {
    let mut config = dev.active_config()?;
    if config.interfaces.len() > MAX_INTERFACES {
        warn!(
            "device exposes {} interfaces, redirecting only the first {}",
            config.interfaces.len(),
            MAX_INTERFACES
        );
        config.interfaces.truncate(MAX_INTERFACES);
    }
    Ok(config)
}

fn check_filter(
    rules: &FilterRules,
    desc: &backend::DeviceDescriptor,
    config: Option<&backend::ConfigDescriptor>,
) -> bool {
    let interfaces: Vec<InterfaceClass> = config
        .map(|c| {
            c.interfaces
                .iter()
                .map(|i| InterfaceClass {
                    class: i.class,
                    subclass: i.subclass,
                    protocol: i.protocol,
                })
                .collect()
        })
        .unwrap_or_default();
    rules.check(
        desc.class,
        desc.vendor_id,
        desc.product_id,
        desc.version_bcd,
        &interfaces,
        CheckOptions::default(),
    )
}

/// Rebuild the whole endpoint table from an active configuration.
fn parse_endpoints(t: &mut TransferTable, config: &backend::ConfigDescriptor, speed: DeviceSpeed) {
    for slot in t.endpoints.iter_mut() {
        *slot = EndpointSlot::invalid();
    }
    // Endpoint zero is the control pipe, both directions.
    t.endpoints[ep_index(0x00)].ep_type = EP_TYPE_CONTROL;
    t.endpoints[ep_index(0x80)].ep_type = EP_TYPE_CONTROL;

    for iface in &config.interfaces {
        parse_one_interface(t, iface, speed);
    }
}

fn parse_one_interface(
    t: &mut TransferTable,
    iface: &backend::InterfaceDescriptor,
    speed: DeviceSpeed,
) {
    for ep in &iface.endpoints {
        let idx = ep_index(ep.address);
        let ep_type = ep.attributes & 0x03;
        let slot = &mut t.endpoints[idx];
        slot.ep_type = ep_type;
        slot.interval = ep.interval;
        slot.interface = iface.number;
        slot.max_packet_size = effective_max_packet_size(speed, ep_type, ep.max_packet_size);
        slot.max_streams = ep.max_streams;
        debug!(
            "endpoint {:02x}: type {} interval {} interface {} maxp {} streams {}",
            ep.address, slot.ep_type, slot.interval, slot.interface, slot.max_packet_size,
            slot.max_streams
        );
    }
}

#[cfg(test)]
mod tests {
    use super::backend::*;
    use super::*;
    use crate::parser::testing::{Event, Pipe, PipeTransport, Recorder};

    struct Pending {
        handle: usize,
        request: TransferRequest,
        completion: Option<CompletionFn>,
        cancelled: bool,
    }

    #[derive(Default)]
    struct MockState {
        pending: Vec<Pending>,
        next_handle: usize,
        calls: Vec<String>,
    }

    struct MockDevice {
        desc: DeviceDescriptor,
        config: ConfigDescriptor,
        state: Mutex<MockState>,
    }

    fn ep(address: u8, attributes: u8, max_packet_size: u16) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            attributes,
            max_packet_size,
            interval: if attributes & 3 == EP_TYPE_BULK { 0 } else { 4 },
            max_streams: 0,
        }
    }

    impl MockDevice {
        fn new() -> Arc<MockDevice> {
            Arc::new(MockDevice {
                desc: DeviceDescriptor {
                    speed: DeviceSpeed::High,
                    class: 0,
                    subclass: 0,
                    protocol: 0,
                    vendor_id: 0x1d50,
                    product_id: 0x606f,
                    version_bcd: 0x0100,
                },
                config: ConfigDescriptor {
                    value: 1,
                    interfaces: vec![InterfaceDescriptor {
                        number: 0,
                        alt_setting: 0,
                        class: 0xff,
                        subclass: 0,
                        protocol: 0,
                        endpoints: vec![
                            ep(0x81, EP_TYPE_BULK, 512),
                            ep(0x02, EP_TYPE_BULK, 512),
                            ep(0x03, EP_TYPE_ISO, 512),
                            ep(0x85, EP_TYPE_ISO, 256),
                            ep(0x84, EP_TYPE_INTERRUPT, 64),
                        ],
                    }],
                },
                state: Mutex::new(MockState::default()),
            })
        }

        fn pending_count(&self) -> usize {
            self.state.lock().unwrap().pending.len()
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        /// Complete the oldest submission with `result`, even one that has a
        /// cancel outstanding (that is exactly the completion-vs-cancel race).
        fn complete_first(&self, result: TransferResult) {
            let completion = {
                let mut state = self.state.lock().unwrap();
                assert!(!state.pending.is_empty(), "no pending transfer");
                let mut pending = state.pending.remove(0);
                pending.completion.take().expect("completion")
            };
            completion(result);
        }
    }

    fn done(data: Vec<u8>) -> TransferResult {
        TransferResult {
            status: TransferStatus::Completed,
            actual: data.len(),
            data,
            iso_packets: Vec::new(),
        }
    }

    fn failed(status: TransferStatus) -> TransferResult {
        TransferResult {
            status,
            actual: 0,
            data: Vec::new(),
            iso_packets: Vec::new(),
        }
    }

    impl UsbDevice for MockDevice {
        fn descriptor(&self) -> DeviceDescriptor {
            self.desc
        }

        fn active_config(&self) -> io::Result<ConfigDescriptor> {
            Ok(self.config.clone())
        }

        fn set_auto_detach_kernel_driver(&self, _enable: bool) {}

        fn claim_interface(&self, number: u8) -> io::Result<()> {
            self.state
                .lock()
                .unwrap()
                .calls
                .push(format!("claim({number})"));
            Ok(())
        }

        fn release_interface(&self, number: u8) -> io::Result<()> {
            self.state
                .lock()
                .unwrap()
                .calls
                .push(format!("release({number})"));
            Ok(())
        }

        fn set_configuration(&self, value: u8) -> io::Result<()> {
            self.state
                .lock()
                .unwrap()
                .calls
                .push(format!("set_configuration({value})"));
            Ok(())
        }

        fn set_alt_setting(&self, interface: u8, alt: u8) -> io::Result<()> {
            self.state
                .lock()
                .unwrap()
                .calls
                .push(format!("set_alt_setting({interface},{alt})"));
            Ok(())
        }

        fn reset(&self) -> io::Result<()> {
            self.state.lock().unwrap().calls.push("reset".into());
            Ok(())
        }

        fn clear_halt(&self, endpoint: u8) -> io::Result<()> {
            self.state
                .lock()
                .unwrap()
                .calls
                .push(format!("clear_halt({endpoint:02x})"));
            Ok(())
        }

        fn alloc_streams(&self, _endpoints: &[u8], count: u32) -> io::Result<u32> {
            Ok(count)
        }

        fn free_streams(&self, _endpoints: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn submit(
            &self,
            request: TransferRequest,
            completion: CompletionFn,
        ) -> io::Result<TransferHandle> {
            let mut state = self.state.lock().unwrap();
            state.next_handle += 1;
            let handle = state.next_handle;
            state.pending.push(Pending {
                handle,
                request,
                completion: Some(completion),
                cancelled: false,
            });
            Ok(TransferHandle(handle))
        }

        fn cancel(&self, handle: TransferHandle) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            match state.pending.iter_mut().find(|p| p.handle == handle.0) {
                Some(p) => {
                    p.cancelled = true;
                    Ok(())
                }
                None => Err(io::Error::new(io::ErrorKind::NotFound, "already done")),
            }
        }

        fn poll_completions(&self, _timeout: Duration) {
            // Deliver every cancellation that is still outstanding.
            let ready: Vec<CompletionFn> = {
                let mut state = self.state.lock().unwrap();
                let mut ready = Vec::new();
                state.pending.retain_mut(|p| {
                    if p.cancelled {
                        ready.push(p.completion.take().expect("completion"));
                        false
                    } else {
                        true
                    }
                });
                ready
            };
            for completion in ready {
                completion(failed(TransferStatus::Cancelled));
            }
        }
    }

    struct Rig {
        host: Host,
        guest: Parser,
        rec: Recorder,
        dev: Arc<MockDevice>,
    }

    const GUEST_CAPS: &[u32] = &[
        CAP_CONNECT_DEVICE_VERSION,
        CAP_FILTER,
        CAP_EP_INFO_MAX_PACKET_SIZE,
        CAP_64BITS_IDS,
        CAP_32BITS_BULK_LENGTH,
        CAP_BULK_STREAMS,
        CAP_BULK_RECEIVING,
    ];

    impl Rig {
        fn new() -> Rig {
            let g2h = Pipe::default();
            let h2g = Pipe::default();
            let host = Host::new(
                Box::new(PipeTransport {
                    rx: g2h.clone(),
                    tx: h2g.clone(),
                }),
                "host under test",
                HostFlags::default(),
                None,
            );
            let rec = Recorder::default();
            let guest = Parser::new(
                Box::new(rec.clone()),
                Box::new(PipeTransport { rx: h2g, tx: g2h }),
                "test guest",
                GUEST_CAPS,
                ParserFlags::default(),
            );
            Rig {
                host,
                guest,
                rec,
                dev: MockDevice::new(),
            }
        }

        fn pump(&self) {
            for _ in 0..4 {
                let _ = self.guest.do_write();
                let _ = self.host.do_read();
                let _ = self.host.do_write();
                let _ = self.guest.do_read();
            }
        }

        fn connected() -> Rig {
            let rig = Rig::new();
            rig.pump();
            rig.host.set_device(Some(rig.dev.clone())).unwrap();
            rig.pump();
            rig.rec.events().clear();
            rig
        }

        fn events(&self) -> Vec<Event> {
            std::mem::take(&mut *self.rec.events())
        }
    }

    #[test]
    fn connect_sends_info_then_device_connect() {
        let rig = Rig::new();
        rig.pump();
        rig.host.set_device(Some(rig.dev.clone())).unwrap();
        rig.pump();

        let events = rig.events();
        let tail: Vec<&Event> = events.iter().rev().take(3).collect();
        assert!(matches!(tail[2], Event::EpInfo(_)));
        assert!(matches!(tail[1], Event::InterfaceInfo(_)));
        match tail[0] {
            Event::DeviceConnect(h) => {
                assert_eq!(h.vendor_id, 0x1d50);
                assert_eq!(h.product_id, 0x606f);
                assert_eq!(h.speed, SPEED_HIGH);
                assert_eq!(h.device_version_bcd, 0x0100);
            }
            other => unreachable!("expected device_connect, got {other:?}"),
        }
        assert_eq!(rig.dev.calls(), vec!["claim(0)".to_string()]);

        // The endpoint table made it across with max packet sizes.
        match events.iter().find(|e| matches!(e, Event::EpInfo(_))) {
            Some(Event::EpInfo(info)) => {
                assert_eq!(info.ep_type[ep_index(0x81)], EP_TYPE_BULK);
                assert_eq!(info.max_packet_size[ep_index(0x81)], 512);
                assert_eq!(info.ep_type[ep_index(0x84)], EP_TYPE_INTERRUPT);
                assert_eq!(info.ep_type[ep_index(0x00)], EP_TYPE_CONTROL);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn cancel_race_reports_exactly_once() {
        let rig = Rig::connected();

        let hdr = ControlPacketHeader {
            endpoint: 0x00,
            request: 0x09,
            requesttype: 0x00,
            status: 0,
            value: 1,
            index: 0,
            length: 4,
        };
        rig.guest
            .send(42, &Packet::ControlPacket(hdr), b"abcd");
        rig.pump();
        assert_eq!(rig.dev.pending_count(), 1);

        rig.guest.send(42, &Packet::CancelDataPacket, &[]);
        rig.pump();

        let events = rig.events();
        let replies: Vec<&Event> = events
            .iter()
            .filter(|e| matches!(e, Event::ControlPacket(42, _, _)))
            .collect();
        assert_eq!(replies.len(), 1);
        match replies[0] {
            Event::ControlPacket(_, h, data) => {
                assert_eq!(h.status, STATUS_CANCELLED);
                assert_eq!(h.length, 0);
                assert!(data.is_empty());
            }
            _ => unreachable!(),
        }

        // A late native completion with success is discarded.
        rig.dev.complete_first(done(b"abcd".to_vec()));
        rig.pump();
        assert!(rig
            .events()
            .iter()
            .all(|e| !matches!(e, Event::ControlPacket(42, _, _))));
    }

    #[test]
    fn iso_output_waits_for_half_the_ring() {
        let rig = Rig::connected();

        rig.guest.send(
            10,
            &Packet::StartIsoStream(StartIsoStreamHeader {
                endpoint: 0x03,
                pkts_per_urb: 8,
                no_urbs: 4,
            }),
            &[],
        );
        rig.pump();
        // Output streams do not claim success at alloc time.
        assert!(rig
            .events()
            .iter()
            .all(|e| !matches!(e, Event::IsoStreamStatus(_, _))));

        let payload = vec![0u8; 512];
        for _ in 0..15 {
            rig.guest.send(
                0,
                &Packet::IsoPacket(IsoPacketHeader {
                    endpoint: 0x03,
                    status: 0,
                    length: 512,
                }),
                &payload,
            );
        }
        rig.pump();
        // 15 packets buffered: half the ring is 16, nothing submitted yet.
        assert_eq!(rig.dev.pending_count(), 0);

        rig.guest.send(
            0,
            &Packet::IsoPacket(IsoPacketHeader {
                endpoint: 0x03,
                status: 0,
                length: 512,
            }),
            &payload,
        );
        rig.pump();
        assert_eq!(rig.dev.pending_count(), 2);

        {
            let st = rig.dev.state.lock().unwrap();
            match &st.pending[0].request {
                TransferRequest::Iso {
                    num_packets,
                    packet_len,
                    lengths,
                    data,
                    ..
                } => {
                    assert_eq!(*num_packets, 8);
                    assert_eq!(*packet_len, 512);
                    assert_eq!(lengths, &vec![512u32; 8]);
                    assert_eq!(data.len(), 8 * 512);
                }
                other => unreachable!("expected an iso submission, got {other:?}"),
            }
        }

        let t = rig.host.inner.transfers.lock().unwrap();
        let stream = t.endpoints[ep_index(0x03)].stream.as_ref().unwrap();
        assert_eq!(stream.transfers[0].packet_idx, SUBMITTED_IDX);
        assert_eq!(stream.transfers[1].packet_idx, SUBMITTED_IDX);
        assert_eq!(stream.transfers[2].packet_idx, 0);
        assert!(stream.started);
    }

    #[test]
    fn set_configuration_reannounces_before_status() {
        let rig = Rig::connected();

        rig.guest.send(
            7,
            &Packet::SetConfiguration(SetConfigurationHeader { configuration: 1 }),
            &[],
        );
        rig.pump();

        let events = rig.events();
        let n = events.len();
        assert!(n >= 3, "expected three packets, got {events:?}");
        assert!(matches!(events[n - 3], Event::EpInfo(_)));
        assert!(matches!(events[n - 2], Event::InterfaceInfo(_)));
        match &events[n - 1] {
            Event::ConfigurationStatus(7, h) => {
                assert_eq!(h.status, STATUS_SUCCESS);
                assert_eq!(h.configuration, 1);
            }
            other => unreachable!("expected configuration_status, got {other:?}"),
        }
        let calls = rig.dev.calls();
        assert!(calls.contains(&"set_configuration(1)".to_string()));
    }

    #[test]
    fn interface_table_is_capped_at_protocol_limit() {
        let rig = Rig::new();
        // More interfaces than the wire protocol has slots for.
        let interfaces: Vec<InterfaceDescriptor> = (0..40)
            .map(|n| InterfaceDescriptor {
                number: n as u8,
                alt_setting: 0,
                class: 0xff,
                subclass: 0,
                protocol: 0,
                endpoints: Vec::new(),
            })
            .collect();
        let dev = Arc::new(MockDevice {
            desc: rig.dev.desc,
            config: ConfigDescriptor {
                value: 1,
                interfaces,
            },
            state: Mutex::new(MockState::default()),
        });

        rig.pump();
        rig.host.set_device(Some(dev)).unwrap();
        rig.pump();
        let events = rig.events();
        match events.iter().find(|e| matches!(e, Event::InterfaceInfo(_))) {
            Some(Event::InterfaceInfo(info)) => {
                assert_eq!(info.interface_count, MAX_INTERFACES as u32);
            }
            _ => unreachable!("expected interface_info"),
        }

        // An interface past the window is simply unknown, not a crash.
        rig.guest.send(
            11,
            &Packet::SetAltSetting(SetAltSettingHeader {
                interface: 35,
                alt: 1,
            }),
            &[],
        );
        rig.pump();
        match rig
            .events()
            .iter()
            .find(|e| matches!(e, Event::AltSettingStatus(_, _)))
        {
            Some(Event::AltSettingStatus(11, h)) => assert_eq!(h.status, STATUS_INVAL),
            other => unreachable!("expected an inval alt status, got {other:?}"),
        }

        // Interfaces inside the window still answer.
        rig.guest.send(
            12,
            &Packet::GetAltSetting(GetAltSettingHeader { interface: 31 }),
            &[],
        );
        rig.pump();
        match rig
            .events()
            .iter()
            .find(|e| matches!(e, Event::AltSettingStatus(_, _)))
        {
            Some(Event::AltSettingStatus(12, h)) => {
                assert_eq!(h.status, STATUS_SUCCESS);
                assert_eq!(h.alt, 0);
            }
            other => unreachable!("expected a success alt status, got {other:?}"),
        }
    }

    #[test]
    fn no_connect_while_disconnect_ack_outstanding() {
        let rig = Rig::connected();

        rig.host.set_device(None).unwrap();
        rig.pump();
        assert!(rig.events().contains(&Event::DeviceDisconnect));

        // Guest has not acked yet: a fresh device must stay pending.
        let second = MockDevice::new();
        rig.host.set_device(Some(second)).unwrap();
        rig.pump();
        assert!(rig
            .events()
            .iter()
            .all(|e| !matches!(e, Event::DeviceConnect(_))));

        rig.guest.send(0, &Packet::DeviceDisconnectAck, &[]);
        rig.pump();
        let events = rig.events();
        assert!(events.iter().any(|e| matches!(e, Event::DeviceConnect(_))));
    }

    #[test]
    fn endpoint_clear_halt_is_not_forwarded() {
        let rig = Rig::connected();

        rig.guest.send(
            5,
            &Packet::ControlPacket(ControlPacketHeader {
                endpoint: 0x00,
                request: USB_REQ_CLEAR_FEATURE,
                requesttype: CLEAR_FEATURE_REQUESTTYPE,
                status: 0,
                value: 0,
                index: 0x02,
                length: 0,
            }),
            &[],
        );
        rig.pump();

        assert_eq!(rig.dev.pending_count(), 0);
        assert!(rig.dev.calls().contains(&"clear_halt(02)".to_string()));
        let events = rig.events();
        match events
            .iter()
            .find(|e| matches!(e, Event::ControlPacket(5, _, _)))
        {
            Some(Event::ControlPacket(_, h, _)) => assert_eq!(h.status, STATUS_SUCCESS),
            _ => unreachable!("expected a synthesised control reply"),
        }
    }

    #[test]
    fn stream_ring_dimension_bounds() {
        let rig = Rig::connected();

        for (pkts, urbs) in [(0u8, 4u8), (33, 4), (8, 0), (8, 17)] {
            rig.guest.send(
                1,
                &Packet::StartIsoStream(StartIsoStreamHeader {
                    endpoint: 0x03,
                    pkts_per_urb: pkts,
                    no_urbs: urbs,
                }),
                &[],
            );
            rig.pump();
            let events = rig.events();
            match events
                .iter()
                .find(|e| matches!(e, Event::IsoStreamStatus(_, _)))
            {
                Some(Event::IsoStreamStatus(_, h)) => assert_eq!(h.status, STATUS_INVAL),
                _ => unreachable!("expected an inval status for {pkts}x{urbs}"),
            }
            assert_eq!(rig.dev.pending_count(), 0);
        }

        // 1 and 32 packets per transfer are both fine.
        rig.guest.send(
            2,
            &Packet::StartIsoStream(StartIsoStreamHeader {
                endpoint: 0x85,
                pkts_per_urb: 32,
                no_urbs: 1,
            }),
            &[],
        );
        rig.pump();
        match rig
            .events()
            .iter()
            .find(|e| matches!(e, Event::IsoStreamStatus(_, _)))
        {
            Some(Event::IsoStreamStatus(_, h)) => assert_eq!(h.status, STATUS_SUCCESS),
            _ => unreachable!(),
        }
        assert_eq!(rig.dev.pending_count(), 1);
    }

    #[test]
    fn double_stream_allocation_is_rejected() {
        let rig = Rig::connected();

        for expect in [STATUS_SUCCESS, STATUS_INVAL] {
            rig.guest.send(
                3,
                &Packet::StartInterruptReceiving(StartInterruptReceivingHeader {
                    endpoint: 0x84,
                }),
                &[],
            );
            rig.pump();
            match rig
                .events()
                .iter()
                .find(|e| matches!(e, Event::InterruptReceivingStatus(_, _)))
            {
                Some(Event::InterruptReceivingStatus(_, h)) => assert_eq!(h.status, expect),
                _ => unreachable!(),
            }
        }
        assert_eq!(rig.dev.pending_count(), INTERRUPT_TRANSFER_COUNT);
    }

    #[test]
    fn interrupt_receiving_forwards_and_resubmits() {
        let rig = Rig::connected();

        rig.guest.send(
            3,
            &Packet::StartInterruptReceiving(StartInterruptReceivingHeader { endpoint: 0x84 }),
            &[],
        );
        rig.pump();
        rig.events();

        rig.dev.complete_first(done(vec![0xaa, 0xbb, 0xcc]));
        rig.pump();
        let events = rig.events();
        match events
            .iter()
            .find(|e| matches!(e, Event::InterruptPacket(_, _, _)))
        {
            Some(Event::InterruptPacket(_, h, data)) => {
                assert_eq!(h.endpoint, 0x84);
                assert_eq!(h.status, STATUS_SUCCESS);
                assert_eq!(h.length, 3);
                assert_eq!(data, &vec![0xaa, 0xbb, 0xcc]);
            }
            _ => unreachable!("expected interrupt data"),
        }
        // The ring slot was resubmitted.
        assert_eq!(rig.dev.pending_count(), INTERRUPT_TRANSFER_COUNT);
    }

    #[test]
    fn stall_recovery_reallocates_the_stream() {
        let rig = Rig::connected();

        rig.guest.send(
            3,
            &Packet::StartInterruptReceiving(StartInterruptReceivingHeader { endpoint: 0x84 }),
            &[],
        );
        rig.pump();
        rig.events();

        rig.dev.complete_first(failed(TransferStatus::Stall));
        // Deliver the cancellations of the rest of the old ring.
        rig.dev.poll_completions(Duration::ZERO);
        rig.pump();

        assert!(rig.dev.calls().contains(&"clear_halt(84)".to_string()));
        // Fresh ring in flight, no stall status reached the guest.
        assert_eq!(rig.dev.pending_count(), INTERRUPT_TRANSFER_COUNT);
        assert!(rig
            .events()
            .iter()
            .all(|e| !matches!(e, Event::InterruptReceivingStatus(_, _))));
    }

    #[test]
    fn iso_input_forwarding_per_packet() {
        let rig = Rig::connected();

        rig.guest.send(
            4,
            &Packet::StartIsoStream(StartIsoStreamHeader {
                endpoint: 0x85,
                pkts_per_urb: 2,
                no_urbs: 2,
            }),
            &[],
        );
        rig.pump();
        rig.events();
        assert_eq!(rig.dev.pending_count(), 2);

        let mut data = vec![0u8; 512];
        data[0] = 0x11;
        data[256] = 0x22;
        rig.dev.complete_first(TransferResult {
            status: TransferStatus::Completed,
            actual: 356,
            data,
            iso_packets: vec![
                IsoPacketResult {
                    status: TransferStatus::Completed,
                    actual: 256,
                },
                IsoPacketResult {
                    status: TransferStatus::Completed,
                    actual: 100,
                },
            ],
        });
        rig.pump();

        let events = rig.events();
        let iso: Vec<&Event> = events
            .iter()
            .filter(|e| matches!(e, Event::IsoPacket(_, _, _)))
            .collect();
        assert_eq!(iso.len(), 2);
        match iso[0] {
            Event::IsoPacket(_, h, data) => {
                assert_eq!(h.length, 256);
                assert_eq!(data[0], 0x11);
            }
            _ => unreachable!(),
        }
        match iso[1] {
            Event::IsoPacket(_, h, data) => {
                assert_eq!(h.length, 100);
                assert_eq!(data[0], 0x22);
            }
            _ => unreachable!(),
        }
        assert_eq!(rig.dev.pending_count(), 2);
    }

    #[test]
    fn filter_reject_surfaces_as_read_status() {
        let rig = Rig::connected();
        rig.guest.send(0, &Packet::FilterReject, &[]);
        let _ = rig.guest.do_write();
        assert!(matches!(
            rig.host.do_read(),
            Err(HostReadError::DeviceRejected)
        ));
    }

    #[test]
    fn bulk_round_trip_with_32bit_length() {
        let rig = Rig::connected();

        let mut hdr = BulkPacketHeader {
            endpoint: 0x81,
            status: 0,
            length: 0,
            stream_id: 0,
            length_high: 0,
        };
        hdr.set_total_length(0x1_0000);
        rig.guest.send(9, &Packet::BulkPacket(hdr), &[]);
        rig.pump();
        assert_eq!(rig.dev.pending_count(), 1);

        rig.dev.complete_first(done(vec![0x5a; 0x1_0000]));
        rig.pump();
        let events = rig.events();
        match events
            .iter()
            .find(|e| matches!(e, Event::BulkPacket(9, _, _)))
        {
            Some(Event::BulkPacket(_, h, data)) => {
                assert_eq!(h.status, STATUS_SUCCESS);
                assert_eq!(h.total_length(), 0x1_0000);
                assert_eq!(data.len(), 0x1_0000);
            }
            _ => unreachable!("expected a bulk reply"),
        }
    }
}
