//! Two parsers talking to each other through in-memory pipes.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use usbredir::packets::*;
use usbredir::proto::*;
use usbredir::{PacketHandler, Parser, ParserFlags, Transport};

#[derive(Clone, Default)]
struct Pipe(Arc<Mutex<VecDeque<u8>>>);

impl Pipe {
    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

struct PipeTransport {
    rx: Pipe,
    tx: Pipe,
}

impl Transport for PipeTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.0.lock().unwrap();
        if rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "empty"));
        }
        let mut n = 0;
        while n < buf.len() {
            match rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.tx.0.lock().unwrap().extend(buf.iter().copied());
        Ok(buf.len())
    }
}

#[derive(Debug, PartialEq)]
enum Event {
    Hello(String),
    Reset,
    DeviceConnect(DeviceConnectHeader),
    DeviceDisconnect,
    ControlPacket(u64, ControlPacketHeader, Vec<u8>),
    BulkPacket(u64, BulkPacketHeader, Vec<u8>),
    IsoPacket(u64, IsoPacketHeader, Vec<u8>),
}

#[derive(Clone, Default)]
struct Collector(Arc<Mutex<Vec<Event>>>);

impl Collector {
    fn events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl PacketHandler for Collector {
    fn hello(&self, _p: &Parser, version: &str) {
        self.0.lock().unwrap().push(Event::Hello(version.into()));
    }
    fn reset(&self, _p: &Parser) {
        self.0.lock().unwrap().push(Event::Reset);
    }
    fn device_connect(&self, _p: &Parser, h: &DeviceConnectHeader) {
        self.0.lock().unwrap().push(Event::DeviceConnect(*h));
    }
    fn control_packet(&self, _p: &Parser, id: u64, h: &ControlPacketHeader, data: Vec<u8>) {
        self.0
            .lock()
            .unwrap()
            .push(Event::ControlPacket(id, *h, data));
    }
    fn bulk_packet(&self, _p: &Parser, id: u64, h: &BulkPacketHeader, data: Vec<u8>) {
        self.0.lock().unwrap().push(Event::BulkPacket(id, *h, data));
    }
    fn iso_packet(&self, _p: &Parser, id: u64, h: &IsoPacketHeader, data: Vec<u8>) {
        self.0.lock().unwrap().push(Event::IsoPacket(id, *h, data));
    }
    fn device_disconnect(&self, _p: &Parser) {
        self.0.lock().unwrap().push(Event::DeviceDisconnect);
    }
}

struct Pair {
    host: Parser,
    guest: Parser,
    host_events: Collector,
    guest_events: Collector,
    to_host: Pipe,
    to_guest: Pipe,
}

fn pair(caps: &[u32]) -> Pair {
    let to_host = Pipe::default();
    let to_guest = Pipe::default();
    let host_events = Collector::default();
    let guest_events = Collector::default();
    let host = Parser::new(
        Box::new(host_events.clone()),
        Box::new(PipeTransport {
            rx: to_host.clone(),
            tx: to_guest.clone(),
        }),
        "device side 0.1",
        caps,
        ParserFlags {
            usb_host: true,
            ..Default::default()
        },
    );
    let guest = Parser::new(
        Box::new(guest_events.clone()),
        Box::new(PipeTransport {
            rx: to_guest.clone(),
            tx: to_host.clone(),
        }),
        "guest side 0.1",
        caps,
        ParserFlags::default(),
    );
    Pair {
        host,
        guest,
        host_events,
        guest_events,
        to_host,
        to_guest,
    }
}

impl Pair {
    fn pump(&self) {
        for _ in 0..4 {
            self.host.do_write().unwrap();
            self.guest.do_write().unwrap();
            let _ = self.host.do_read();
            let _ = self.guest.do_read();
        }
    }
}

#[test]
fn hello_exchange_negotiates_wide_ids() {
    let p = pair(&[CAP_EP_INFO_MAX_PACKET_SIZE, CAP_64BITS_IDS]);

    p.pump();
    assert!(p.host.have_peer_caps());
    assert!(p.guest.have_peer_caps());
    assert_eq!(
        p.host_events.events(),
        vec![Event::Hello("guest side 0.1".into())]
    );
    assert_eq!(
        p.guest_events.events(),
        vec![Event::Hello("device side 0.1".into())]
    );
    assert!(p.host.has_cap(CAP_64BITS_IDS));
    assert!(p.guest.has_cap(CAP_EP_INFO_MAX_PACKET_SIZE));

    // With 64bits_ids mutual the main header is 16 bytes.
    p.guest.send(0x1_0000_0001, &Packet::Reset, &[]);
    p.guest.do_write().unwrap();
    assert_eq!(p.to_host.len(), 16);
    let _ = p.host.do_read();
    assert_eq!(p.host_events.events(), vec![Event::Reset]);
}

#[test]
fn skip_recovery_resynchronises_the_stream() {
    let p = pair(&[]);
    p.pump();

    // An unknown frame, then ten junk bytes, then a valid reset.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x7fff_ffffu32.to_le_bytes());
    bytes.extend_from_slice(&10u32.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&[0x5a; 10]);
    p.to_host.0.lock().unwrap().extend(bytes);
    p.guest.send(2, &Packet::Reset, &[]);
    p.guest.do_write().unwrap();

    assert!(p.host.do_read().is_err());
    assert!(p.host.do_read().is_ok());
    assert_eq!(p.host_events.events(), vec![Event::Reset]);
}

#[test]
fn control_payload_round_trip() {
    let p = pair(&[CAP_32BITS_BULK_LENGTH]);
    p.pump();

    let hdr = ControlPacketHeader {
        endpoint: 0x00,
        request: 0x09,
        requesttype: 0x00,
        status: 0,
        value: 1,
        index: 0,
        length: 6,
    };
    p.guest.send(77, &Packet::ControlPacket(hdr), b"abcdef");
    p.pump();

    assert_eq!(
        p.host_events.events(),
        vec![Event::ControlPacket(77, hdr, b"abcdef".to_vec())]
    );

    // And a large bulk reply back using the 32-bit length extension.
    let mut bulk = BulkPacketHeader {
        endpoint: 0x81,
        status: STATUS_SUCCESS,
        length: 0,
        stream_id: 0,
        length_high: 0,
    };
    bulk.set_total_length(70_000);
    let payload = vec![0xa5; 70_000];
    p.host.send(78, &Packet::BulkPacket(bulk), &payload);
    p.pump();

    let events = p.guest_events.events();
    match &events[..] {
        [Event::BulkPacket(78, h, data)] => {
            assert_eq!(h.total_length(), 70_000);
            assert_eq!(data.len(), 70_000);
        }
        other => unreachable!("expected one bulk packet, got {other:?}"),
    }
}

#[test]
fn device_connect_version_field_follows_caps() {
    // Without connect_device_version the short 8-byte header is used and the
    // version field reads back zero.
    let p = pair(&[]);
    p.pump();

    let hdr = DeviceConnectHeader {
        speed: SPEED_FULL,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        vendor_id: 0x1234,
        product_id: 0x5678,
        device_version_bcd: 0x0302,
    };
    p.host.send(0, &Packet::DeviceConnect(hdr), &[]);
    p.host.do_write().unwrap();
    assert_eq!(p.to_guest.len(), 12 + 8);
    let _ = p.guest.do_read();
    match &p.guest_events.events()[..] {
        [Event::DeviceConnect(h)] => {
            assert_eq!(h.vendor_id, 0x1234);
            assert_eq!(h.device_version_bcd, 0);
        }
        other => unreachable!("unexpected events {other:?}"),
    }
}

#[test]
fn serialization_hands_off_mid_frame() {
    let p = pair(&[]);
    p.pump();

    // Park three bytes of a reset header in the host's reader and queue two
    // outbound frames.
    p.to_host
        .0
        .lock()
        .unwrap()
        .extend(PKT_RESET.to_le_bytes()[..3].iter().copied());
    let _ = p.host.do_read();
    p.host.send(
        0,
        &Packet::IsoPacket(IsoPacketHeader {
            endpoint: 0x81,
            status: STATUS_SUCCESS,
            length: 3,
        }),
        b"xyz",
    );
    p.host.send(0, &Packet::DeviceDisconnect, &[]);

    let blob = p.host.serialize();

    // Restore into a pristine parser wired to the same pipes.
    let restored = Parser::new(
        Box::new(p.host_events.clone()),
        Box::new(PipeTransport {
            rx: p.to_host.clone(),
            tx: p.to_guest.clone(),
        }),
        "device side 0.1",
        &[],
        ParserFlags {
            usb_host: true,
            no_hello: true,
            ..Default::default()
        },
    );
    restored.unserialize(&blob).unwrap();
    assert_eq!(restored.serialize(), blob);

    // Finish the partially received frame on the restored parser.
    {
        let mut rx = p.to_host.0.lock().unwrap();
        rx.push_back(PKT_RESET.to_le_bytes()[3]);
        rx.extend(0u32.to_le_bytes());
        rx.extend(5u32.to_le_bytes());
    }
    let _ = restored.do_read();
    assert_eq!(p.host_events.events(), vec![Event::Reset]);

    // The queued frames drain on the next do_write.
    assert!(restored.has_data_to_write());
    restored.do_write().unwrap();
    assert!(!restored.has_data_to_write());
    let _ = p.guest.do_read();
    let events = p.guest_events.events();
    match &events[..] {
        [Event::IsoPacket(_, h, data), Event::DeviceDisconnect] => {
            assert_eq!(h.length, 3);
            assert_eq!(data, b"xyz");
        }
        other => unreachable!("unexpected events {other:?}"),
    }
}
