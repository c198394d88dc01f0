//! Protocol codec and framing state machine.
//!
//! The parser consumes bytes from a [`Transport`] in whatever chunks arrive,
//! reassembles frames (main header, type header, optional payload), validates
//! them against the negotiated capabilities and per-type rules, and dispatches
//! typed events to a [`PacketHandler`]. Outbound packets are serialized into
//! a FIFO of write buffers drained by [`Parser::do_write`].
//!
//! Threading contract: at most one thread calls [`Parser::do_read`]; any
//! number of threads may concurrently send packets and call
//! [`Parser::do_write`] / [`Parser::has_data_to_write`], which are serialized
//! by an internal lock.

mod queue;
pub mod serialize;

use std::fmt;
use std::io;
use std::sync::Mutex;

use log::{debug, error, info, warn};

use crate::caps::CapSet;
use crate::packets::*;
use crate::proto::*;

use queue::WriteQueue;

/// Byte stream the parser reads from and writes to.
///
/// `read`/`write` follow non-blocking conventions: `ErrorKind::WouldBlock`
/// means no progress right now, `Ok(0)` from `read` means the peer closed.
pub trait Transport: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Called when the write queue has fully drained.
    fn flush_writes(&self) {}

    /// Bytes still buffered by the application, only meaningful together
    /// with [`ParserFlags::write_cb_owns_buffer`].
    fn buffered_output_size(&self) -> usize {
        0
    }
}

/// Consumer of decoded packets. One type implements the whole catalog; the
/// defaults log a protocol error so a missing handler for a reachable type
/// shows up immediately in testing rather than corrupting state.
///
/// For the payload-carrying data packets the decoded buffer is handed over to
/// the handler; for everything else the codec keeps ownership.
#[allow(unused_variables)]
pub trait PacketHandler: Send + Sync {
    fn hello(&self, parser: &Parser, version: &str) {}
    fn device_connect(&self, parser: &Parser, header: &DeviceConnectHeader) {
        unhandled("device_connect");
    }
    fn device_disconnect(&self, parser: &Parser) {
        unhandled("device_disconnect");
    }
    fn reset(&self, parser: &Parser) {
        unhandled("reset");
    }
    fn interface_info(&self, parser: &Parser, header: &InterfaceInfoHeader) {
        unhandled("interface_info");
    }
    fn ep_info(&self, parser: &Parser, header: &EpInfoHeader) {
        unhandled("ep_info");
    }
    fn set_configuration(&self, parser: &Parser, id: u64, header: &SetConfigurationHeader) {
        unhandled("set_configuration");
    }
    fn get_configuration(&self, parser: &Parser, id: u64) {
        unhandled("get_configuration");
    }
    fn configuration_status(&self, parser: &Parser, id: u64, header: &ConfigurationStatusHeader) {
        unhandled("configuration_status");
    }
    fn set_alt_setting(&self, parser: &Parser, id: u64, header: &SetAltSettingHeader) {
        unhandled("set_alt_setting");
    }
    fn get_alt_setting(&self, parser: &Parser, id: u64, header: &GetAltSettingHeader) {
        unhandled("get_alt_setting");
    }
    fn alt_setting_status(&self, parser: &Parser, id: u64, header: &AltSettingStatusHeader) {
        unhandled("alt_setting_status");
    }
    fn start_iso_stream(&self, parser: &Parser, id: u64, header: &StartIsoStreamHeader) {
        unhandled("start_iso_stream");
    }
    fn stop_iso_stream(&self, parser: &Parser, id: u64, header: &StopIsoStreamHeader) {
        unhandled("stop_iso_stream");
    }
    fn iso_stream_status(&self, parser: &Parser, id: u64, header: &IsoStreamStatusHeader) {
        unhandled("iso_stream_status");
    }
    fn start_interrupt_receiving(
        &self,
        parser: &Parser,
        id: u64,
        header: &StartInterruptReceivingHeader,
    ) {
        unhandled("start_interrupt_receiving");
    }
    fn stop_interrupt_receiving(
        &self,
        parser: &Parser,
        id: u64,
        header: &StopInterruptReceivingHeader,
    ) {
        unhandled("stop_interrupt_receiving");
    }
    fn interrupt_receiving_status(
        &self,
        parser: &Parser,
        id: u64,
        header: &InterruptReceivingStatusHeader,
    ) {
        unhandled("interrupt_receiving_status");
    }
    fn alloc_bulk_streams(&self, parser: &Parser, id: u64, header: &AllocBulkStreamsHeader) {
        unhandled("alloc_bulk_streams");
    }
    fn free_bulk_streams(&self, parser: &Parser, id: u64, header: &FreeBulkStreamsHeader) {
        unhandled("free_bulk_streams");
    }
    fn bulk_streams_status(&self, parser: &Parser, id: u64, header: &BulkStreamsStatusHeader) {
        unhandled("bulk_streams_status");
    }
    fn cancel_data_packet(&self, parser: &Parser, id: u64) {
        unhandled("cancel_data_packet");
    }
    fn filter_reject(&self, parser: &Parser) {
        unhandled("filter_reject");
    }
    fn filter_filter(&self, parser: &Parser, rules: &str) {
        unhandled("filter_filter");
    }
    fn device_disconnect_ack(&self, parser: &Parser) {
        unhandled("device_disconnect_ack");
    }
    fn start_bulk_receiving(&self, parser: &Parser, id: u64, header: &StartBulkReceivingHeader) {
        unhandled("start_bulk_receiving");
    }
    fn stop_bulk_receiving(&self, parser: &Parser, id: u64, header: &StopBulkReceivingHeader) {
        unhandled("stop_bulk_receiving");
    }
    fn bulk_receiving_status(&self, parser: &Parser, id: u64, header: &BulkReceivingStatusHeader) {
        unhandled("bulk_receiving_status");
    }
    fn control_packet(&self, parser: &Parser, id: u64, header: &ControlPacketHeader, data: Vec<u8>) {
        unhandled("control_packet");
    }
    fn bulk_packet(&self, parser: &Parser, id: u64, header: &BulkPacketHeader, data: Vec<u8>) {
        unhandled("bulk_packet");
    }
    fn iso_packet(&self, parser: &Parser, id: u64, header: &IsoPacketHeader, data: Vec<u8>) {
        unhandled("iso_packet");
    }
    fn interrupt_packet(
        &self,
        parser: &Parser,
        id: u64,
        header: &InterruptPacketHeader,
        data: Vec<u8>,
    ) {
        unhandled("interrupt_packet");
    }
    fn buffered_bulk_packet(
        &self,
        parser: &Parser,
        id: u64,
        header: &BufferedBulkPacketHeader,
        data: Vec<u8>,
    ) {
        unhandled("buffered_bulk_packet");
    }
}

fn unhandled(name: &str) {
    error!("no handler installed for {} packets, dropping", name);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ParserFlags {
    /// We are the device side of the connection.
    pub usb_host: bool,
    /// Do not queue a `hello` at creation (required for restore targets).
    pub no_hello: bool,
    /// Each write buffer is handed to the transport whole and exactly once.
    pub write_cb_owns_buffer: bool,
}

/// Error surface of [`Parser::do_read`].
#[derive(Debug)]
pub enum ReadError {
    /// Transport failure or peer hang-up; tear the connection down.
    Io(io::Error),
    /// Malformed frame. The reader has resynchronised itself and the
    /// connection remains usable.
    Parse,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Io(e) => write!(f, "transport read error: {e}"),
            ReadError::Parse => write!(f, "protocol parse error"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Io(e) => Some(e),
            ReadError::Parse => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Header,
    TypeHeader,
    Data,
}

pub(crate) struct Reader {
    pub(crate) phase: Phase,
    pub(crate) header: [u8; 16],
    pub(crate) header_len: usize,
    pub(crate) header_read: usize,
    pub(crate) ptype: u32,
    pub(crate) plen: usize,
    pub(crate) pid: u64,
    /// Preallocated to the expected type-header length.
    pub(crate) type_header: Vec<u8>,
    pub(crate) type_header_read: usize,
    /// Preallocated to the expected payload length; empty when none.
    pub(crate) data: Vec<u8>,
    pub(crate) data_read: usize,
    /// Bytes still to discard for error-recovery resynchronisation.
    pub(crate) to_skip: usize,
}

impl Reader {
    fn new() -> Self {
        Reader {
            phase: Phase::Header,
            header: [0; 16],
            header_len: 0,
            header_read: 0,
            ptype: 0,
            plen: 0,
            pid: 0,
            type_header: Vec::new(),
            type_header_read: 0,
            data: Vec::new(),
            data_read: 0,
            to_skip: 0,
        }
    }

    fn reset_frame(&mut self) {
        self.phase = Phase::Header;
        self.header_len = 0;
        self.header_read = 0;
        self.ptype = 0;
        self.plen = 0;
        self.pid = 0;
        self.type_header = Vec::new();
        self.type_header_read = 0;
        self.data = Vec::new();
        self.data_read = 0;
    }

    pub(crate) fn is_pristine(&self) -> bool {
        self.phase == Phase::Header && self.header_read == 0 && self.to_skip == 0
    }
}

pub(crate) struct CapsState {
    pub(crate) ours: CapSet,
    pub(crate) peer: Option<CapSet>,
}

pub struct Parser {
    handler: Box<dyn PacketHandler>,
    transport: Box<dyn Transport>,
    flags: ParserFlags,
    pub(crate) caps: Mutex<CapsState>,
    pub(crate) reader: Mutex<Reader>,
    pub(crate) queue: Mutex<WriteQueue>,
}

impl Parser {
    /// Create a parser announcing `caps_bits`. Unless
    /// [`ParserFlags::no_hello`] is set, a `hello` carrying `version` and our
    /// capabilities is queued immediately.
    pub fn new(
        handler: Box<dyn PacketHandler>,
        transport: Box<dyn Transport>,
        version: &str,
        caps_bits: &[u32],
        flags: ParserFlags,
    ) -> Parser {
        let mut ours = CapSet::from_bits(caps_bits);
        if !flags.usb_host {
            // Guest side always acknowledges disconnects.
            ours.set(CAP_DEVICE_DISCONNECT_ACK);
        }
        ours.sanitize("our");

        let parser = Parser {
            handler,
            transport,
            flags,
            caps: Mutex::new(CapsState { ours, peer: None }),
            reader: Mutex::new(Reader::new()),
            queue: Mutex::new(WriteQueue::new()),
        };
        if !flags.no_hello {
            parser.queue_hello(version);
        }
        parser
    }

    fn queue_hello(&self, version: &str) {
        let ours = self.caps.lock().unwrap().ours;
        let mut payload = Vec::with_capacity(4 * ours.words().len());
        for word in ours.words() {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        self.send(0, &Packet::Hello(HelloHeader::new(version)), &payload);
    }

    pub fn usb_host(&self) -> bool {
        self.flags.usb_host
    }

    pub fn owns_buffer(&self) -> bool {
        self.flags.write_cb_owns_buffer
    }

    pub fn have_peer_caps(&self) -> bool {
        self.caps.lock().unwrap().peer.is_some()
    }

    pub fn peer_has_cap(&self, bit: u32) -> bool {
        self.caps
            .lock()
            .unwrap()
            .peer
            .map(|p| p.has(bit))
            .unwrap_or(false)
    }

    /// Mutual capability: announced by us and by the peer.
    pub fn has_cap(&self, bit: u32) -> bool {
        self.effective_caps().has(bit)
    }

    pub(crate) fn effective_caps(&self) -> CapSet {
        let caps = self.caps.lock().unwrap();
        match caps.peer {
            Some(peer) => caps.ours.intersect(&peer),
            None => CapSet::empty(),
        }
    }

    fn header_len_for(&self, ptype: u32, caps: &CapSet) -> usize {
        // hello always travels with 32-bit ids.
        if ptype != PKT_HELLO && caps.has(CAP_64BITS_IDS) {
            16
        } else {
            12
        }
    }

    fn current_header_len(&self) -> usize {
        if self.effective_caps().has(CAP_64BITS_IDS) {
            16
        } else {
            12
        }
    }

    /// Serialize and queue one packet. Invalid packets (wrong direction,
    /// failed type rules) are logged and dropped; wire errors surface to the
    /// peer as status packets, never as send failures.
    pub fn send(&self, id: u64, pkt: &Packet, data: &[u8]) {
        let ptype = pkt.type_id();
        let caps = self.effective_caps();

        if !direction_ok(ptype, self.flags.usb_host) {
            error!(
                "attempt to send {} in the wrong direction, dropping",
                packet_type_name(ptype)
            );
            return;
        }
        if !data.is_empty() && !carries_payload(ptype) {
            error!(
                "attempt to send {} with payload, dropping",
                packet_type_name(ptype)
            );
            return;
        }
        match check_packet(pkt, data.len(), &caps, self.flags.usb_host) {
            PacketCheck::Ok => {}
            PacketCheck::Invalid(msg) | PacketCheck::Unsupported(msg) => {
                error!("refusing to send {}: {}", packet_type_name(ptype), msg);
                return;
            }
        }

        let mut type_header = Vec::new();
        pkt.encode_type_header(&caps, &mut type_header);
        debug_assert_eq!(Some(type_header.len()), type_header_len(ptype, &caps));

        let header_len = self.header_len_for(ptype, &caps);
        let plen = (type_header.len() + data.len()) as u32;

        let mut frame = Vec::with_capacity(header_len + plen as usize);
        frame.extend_from_slice(&ptype.to_le_bytes());
        frame.extend_from_slice(&plen.to_le_bytes());
        if header_len == 16 {
            frame.extend_from_slice(&id.to_le_bytes());
        } else {
            frame.extend_from_slice(&(id as u32).to_le_bytes());
        }
        frame.extend_from_slice(&type_header);
        frame.extend_from_slice(data);

        debug!(
            "queuing {} id {} len {}",
            packet_type_name(ptype),
            id,
            plen
        );
        self.queue.lock().unwrap().push(frame);
    }

    /// Queue a `filter_filter` packet; the payload is the NUL-terminated
    /// canonical rule string.
    pub fn send_filter(&self, rules: &str) {
        let mut payload = Vec::with_capacity(rules.len() + 1);
        payload.extend_from_slice(rules.as_bytes());
        payload.push(0);
        self.send(0, &Packet::FilterFilter, &payload);
    }

    pub fn has_data_to_write(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    /// Total bytes queued for the wire (plus anything the application still
    /// buffers when it owns the write buffers).
    pub fn buffered_output_size(&self) -> usize {
        let queued = self.queue.lock().unwrap().total_size();
        if self.flags.write_cb_owns_buffer {
            queued + self.transport.buffered_output_size()
        } else {
            queued
        }
    }

    /// Drain the write queue. `Ok(())` means either everything was written or
    /// the transport would block; errors are fatal to the connection.
    pub fn do_write(&self) -> io::Result<()> {
        let mut q = self.queue.lock().unwrap();
        while !q.is_empty() {
            if self.flags.write_cb_owns_buffer {
                let buf = q.pop_front().expect("queue not empty");
                let len = buf.data.len();
                match self.transport.write(&buf.data) {
                    Ok(n) if n == len => {}
                    Ok(n) => {
                        error!(
                            "write callback owns buffers but consumed {} of {} bytes",
                            n, len
                        );
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "partial write with owned buffers",
                        ));
                    }
                    Err(e) => return Err(e),
                }
            } else {
                let buf = q.front_mut().expect("queue not empty");
                let pos = buf.pos;
                match self.transport.write(&buf.data[pos..]) {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        buf.pos += n;
                        if buf.pos == buf.data.len() {
                            q.pop_front();
                        }
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.transport.flush_writes();
        Ok(())
    }

    /// Pump the reader: consume whatever the transport has, dispatching every
    /// complete frame. Returns when the transport would block.
    ///
    /// Only one thread may call this; handler callbacks run on that thread.
    pub fn do_read(&self) -> Result<(), ReadError> {
        let mut r = self.reader.lock().unwrap();
        loop {
            // Resynchronisation after a malformed frame.
            while r.to_skip > 0 {
                let mut scratch = [0u8; 4096];
                let want = r.to_skip.min(scratch.len());
                match self.transport.read(&mut scratch[..want]) {
                    Ok(0) => return Err(ReadError::Io(peer_closed())),
                    Ok(n) => r.to_skip -= n,
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        return Ok(());
                    }
                    Err(e) => return Err(ReadError::Io(e)),
                }
            }

            match r.phase {
                Phase::Header => {
                    if r.header_read == 0 {
                        // An incoming hello always uses the short header; the
                        // two cannot disagree because 64bits_ids is never in
                        // effect before the peer's hello has been parsed.
                        r.header_len = self.current_header_len();
                    }
                    let reader = &mut *r;
                    let target = reader.header_len;
                    if !fill(
                        self.transport.as_ref(),
                        &mut reader.header[..target],
                        &mut reader.header_read,
                    )? {
                        return Ok(());
                    }
                    if self.begin_frame(&mut r).is_err() {
                        return Err(ReadError::Parse);
                    }
                }
                Phase::TypeHeader => {
                    let reader = &mut *r;
                    if !fill(
                        self.transport.as_ref(),
                        &mut reader.type_header,
                        &mut reader.type_header_read,
                    )? {
                        return Ok(());
                    }
                    r.phase = Phase::Data;
                }
                Phase::Data => {
                    let reader = &mut *r;
                    if !fill(
                        self.transport.as_ref(),
                        &mut reader.data,
                        &mut reader.data_read,
                    )? {
                        return Ok(());
                    }
                    if self.finish_frame(&mut r).is_err() {
                        return Err(ReadError::Parse);
                    }
                }
            }
        }
    }

    /// Validate a completed main header and size the rest of the frame.
    /// On error the reader is put into skip mode.
    fn begin_frame(&self, r: &mut Reader) -> Result<(), ()> {
        r.ptype = u32::from_le_bytes(r.header[0..4].try_into().unwrap());
        r.plen = u32::from_le_bytes(r.header[4..8].try_into().unwrap()) as usize;
        r.pid = if r.header_len == 16 {
            u64::from_le_bytes(r.header[8..16].try_into().unwrap())
        } else {
            u32::from_le_bytes(r.header[8..12].try_into().unwrap()) as u64
        };

        let caps = self.effective_caps();
        let from_host = !self.flags.usb_host;

        let fail = |msg: &str, r: &mut Reader| {
            error!(
                "invalid {} frame (type {} len {}): {}, skipping",
                packet_type_name(r.ptype),
                r.ptype,
                r.plen,
                msg
            );
            let skip = r.plen;
            r.reset_frame();
            r.to_skip = skip;
            Err(())
        };

        if r.plen > MAX_PACKET_SIZE {
            return fail("length exceeds maximum packet size", r);
        }
        if !direction_ok(r.ptype, from_host) {
            return fail("unknown type or wrong direction", r);
        }
        let th_len = match type_header_len(r.ptype, &caps) {
            Some(l) => l,
            None => return fail("unknown type", r),
        };
        if r.plen < th_len {
            return fail("length shorter than the type header", r);
        }
        if r.plen > th_len && !carries_payload(r.ptype) {
            return fail("unexpected payload", r);
        }

        r.type_header = vec![0; th_len];
        r.type_header_read = 0;
        r.data = vec![0; r.plen - th_len];
        r.data_read = 0;
        r.phase = Phase::TypeHeader;
        Ok(())
    }

    /// Decode, validate and dispatch a fully buffered frame.
    fn finish_frame(&self, r: &mut Reader) -> Result<(), ()> {
        let caps = self.effective_caps();
        let from_host = !self.flags.usb_host;

        let pkt = match Packet::decode_type_header(r.ptype, &caps, &r.type_header) {
            Some(pkt) => pkt,
            None => {
                // begin_frame already rejected unknown types.
                r.reset_frame();
                return Err(());
            }
        };
        let id = r.pid;
        let data = std::mem::take(&mut r.data);
        let data_len = data.len();
        r.reset_frame();

        // hello carries its capability words as payload and updates the
        // negotiated state before anything else sees it.
        if let Packet::Hello(ref hello) = pkt {
            if !self.accept_hello(hello, &data) {
                return Ok(());
            }
            self.handler.hello(self, hello.version_str());
            return Ok(());
        }

        match check_packet(&pkt, data_len, &caps, from_host) {
            PacketCheck::Ok => {}
            PacketCheck::Invalid(msg) => {
                error!("invalid {} packet: {}", packet_type_name(pkt.type_id()), msg);
                return Err(());
            }
            PacketCheck::Unsupported(msg) => {
                warn!(
                    "peer misused the protocol ({}), ignoring {} packet",
                    msg,
                    packet_type_name(pkt.type_id())
                );
                return Ok(());
            }
        }

        self.dispatch(id, pkt, data);
        Ok(())
    }

    fn accept_hello(&self, hello: &HelloHeader, data: &[u8]) -> bool {
        if data.len() % 4 != 0 {
            error!("hello capability array is not a whole number of words");
            return false;
        }
        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let mut peer_caps = CapSet::from_words(&words);
        peer_caps.sanitize("peer");

        let mut caps = self.caps.lock().unwrap();
        if caps.peer.is_some() {
            info!("received a second hello, ignoring");
            return false;
        }
        caps.peer = Some(peer_caps);
        info!(
            "peer is \"{}\" with caps {:#010x}",
            hello.version_str(),
            peer_caps.words()[0]
        );
        true
    }

    fn dispatch(&self, id: u64, pkt: Packet, data: Vec<u8>) {
        let h = self.handler.as_ref();
        match pkt {
            Packet::Hello(_) => unreachable!("hello handled in finish_frame"),
            Packet::DeviceConnect(hdr) => h.device_connect(self, &hdr),
            Packet::DeviceDisconnect => h.device_disconnect(self),
            Packet::Reset => h.reset(self),
            Packet::InterfaceInfo(hdr) => h.interface_info(self, &hdr),
            Packet::EpInfo(hdr) => h.ep_info(self, &hdr),
            Packet::SetConfiguration(hdr) => h.set_configuration(self, id, &hdr),
            Packet::GetConfiguration => h.get_configuration(self, id),
            Packet::ConfigurationStatus(hdr) => h.configuration_status(self, id, &hdr),
            Packet::SetAltSetting(hdr) => h.set_alt_setting(self, id, &hdr),
            Packet::GetAltSetting(hdr) => h.get_alt_setting(self, id, &hdr),
            Packet::AltSettingStatus(hdr) => h.alt_setting_status(self, id, &hdr),
            Packet::StartIsoStream(hdr) => h.start_iso_stream(self, id, &hdr),
            Packet::StopIsoStream(hdr) => h.stop_iso_stream(self, id, &hdr),
            Packet::IsoStreamStatus(hdr) => h.iso_stream_status(self, id, &hdr),
            Packet::StartInterruptReceiving(hdr) => h.start_interrupt_receiving(self, id, &hdr),
            Packet::StopInterruptReceiving(hdr) => h.stop_interrupt_receiving(self, id, &hdr),
            Packet::InterruptReceivingStatus(hdr) => h.interrupt_receiving_status(self, id, &hdr),
            Packet::AllocBulkStreams(hdr) => h.alloc_bulk_streams(self, id, &hdr),
            Packet::FreeBulkStreams(hdr) => h.free_bulk_streams(self, id, &hdr),
            Packet::BulkStreamsStatus(hdr) => h.bulk_streams_status(self, id, &hdr),
            Packet::CancelDataPacket => h.cancel_data_packet(self, id),
            Packet::FilterReject => h.filter_reject(self),
            Packet::FilterFilter => {
                // The codec keeps ownership of short non-data payloads; the
                // handler gets a borrowed, NUL-stripped string.
                if data.last() != Some(&0) {
                    error!("filter_filter string is not NUL-terminated, dropping");
                    return;
                }
                match std::str::from_utf8(&data[..data.len() - 1]) {
                    Ok(rules) => h.filter_filter(self, rules),
                    Err(_) => error!("filter_filter string is not valid utf-8, dropping"),
                }
            }
            Packet::DeviceDisconnectAck => h.device_disconnect_ack(self),
            Packet::StartBulkReceiving(hdr) => h.start_bulk_receiving(self, id, &hdr),
            Packet::StopBulkReceiving(hdr) => h.stop_bulk_receiving(self, id, &hdr),
            Packet::BulkReceivingStatus(hdr) => h.bulk_receiving_status(self, id, &hdr),
            Packet::ControlPacket(hdr) => h.control_packet(self, id, &hdr, data),
            Packet::BulkPacket(hdr) => h.bulk_packet(self, id, &hdr, data),
            Packet::IsoPacket(hdr) => h.iso_packet(self, id, &hdr, data),
            Packet::InterruptPacket(hdr) => h.interrupt_packet(self, id, &hdr, data),
            Packet::BufferedBulkPacket(hdr) => h.buffered_bulk_packet(self, id, &hdr, data),
        }
    }
}

fn peer_closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")
}

/// Read into `buf[*read..]` until full. `Ok(true)` = complete,
/// `Ok(false)` = transport would block.
fn fill(transport: &dyn Transport, buf: &mut [u8], read: &mut usize) -> Result<bool, ReadError> {
    while *read < buf.len() {
        match transport.read(&mut buf[*read..]) {
            Ok(0) => return Err(ReadError::Io(peer_closed())),
            Ok(n) => *read += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(false);
            }
            Err(e) => return Err(ReadError::Io(e)),
        }
    }
    Ok(true)
}
