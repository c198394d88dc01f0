//! Mid-stream snapshot and restore of the codec state.
//!
//! The blob captures the negotiated capabilities, the skip counter, any
//! partially read frame and the queued outbound buffers, so a connection can
//! be handed off between processes without dropping an in-flight packet or
//! losing queued sends. The layout is little-endian and stable:
//!
//! ```text
//! magic, total_len,
//! our_caps   (word count + words),
//! peer_caps  (word count + words, count 0 when unknown),
//! to_skip,
//! partial header      (byte count + bytes),
//! partial type header (byte count + bytes),
//! partial payload     (byte count + bytes),
//! write_buf_count, { byte count + bytes } x count
//! ```

use std::io;

use log::warn;

use crate::caps::CapSet;
use crate::proto::MAX_PACKET_SIZE;

use super::{Parser, Phase};

/// "URP1"
pub const SERIALIZE_MAGIC: u32 = 0x5552_5031;

/// Cap on restore-side allocations besides frame payloads.
const MAX_WRITE_BUFS: u32 = 128 * 1024;

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_section(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

struct Blob<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Blob<'a> {
    fn u32(&mut self) -> io::Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn bytes(&mut self, len: usize) -> io::Result<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated parser state blob",
            ));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn section(&mut self, max: usize) -> io::Result<&'a [u8]> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized section in parser state blob",
            ));
        }
        self.bytes(len)
    }
}

fn bad(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Parser {
    /// Snapshot the complete reader and queue state into a byte blob.
    pub fn serialize(&self) -> Vec<u8> {
        // One consistent snapshot: all three locks held together, in the
        // global reader < caps < queue order.
        let reader = self.reader.lock().unwrap();
        let caps = self.caps.lock().unwrap();
        let queue = self.queue.lock().unwrap();

        let mut out = Vec::new();
        put_u32(&mut out, SERIALIZE_MAGIC);
        put_u32(&mut out, 0); // patched below

        put_u32(&mut out, caps.ours.words().len() as u32);
        for w in caps.ours.words() {
            put_u32(&mut out, *w);
        }
        match caps.peer {
            Some(peer) => {
                put_u32(&mut out, peer.words().len() as u32);
                for w in peer.words() {
                    put_u32(&mut out, *w);
                }
            }
            None => put_u32(&mut out, 0),
        }

        put_u32(&mut out, reader.to_skip as u32);
        put_section(&mut out, &reader.header[..reader.header_read]);
        put_section(&mut out, &reader.type_header[..reader.type_header_read]);
        put_section(&mut out, &reader.data[..reader.data_read]);

        put_u32(&mut out, queue.count() as u32);
        for buf in queue.iter() {
            put_section(&mut out, &buf.data[buf.pos..]);
        }

        let total = out.len() as u32;
        out[4..8].copy_from_slice(&total.to_le_bytes());
        out
    }

    /// Restore a snapshot into this parser. The target must be pristine: no
    /// queued writes, no partial frame, no established peer caps (create it
    /// with [`super::ParserFlags::no_hello`]).
    ///
    /// A snapshot announcing fewer capabilities than we were created with is
    /// accepted with a warning (the wire encoding keeps following the
    /// snapshot); one announcing capabilities we do not know is rejected.
    pub fn unserialize(&self, blob: &[u8]) -> io::Result<()> {
        let mut reader = self.reader.lock().unwrap();
        let mut caps = self.caps.lock().unwrap();
        let mut queue = self.queue.lock().unwrap();

        if !reader.is_pristine() || caps.peer.is_some() || !queue.is_empty() {
            return Err(bad("restore target is not a pristine parser"));
        }

        let mut b = Blob {
            data: blob,
            pos: 0,
        };
        if b.u32()? != SERIALIZE_MAGIC {
            return Err(bad("bad magic in parser state blob"));
        }
        if b.u32()? as usize != blob.len() {
            return Err(bad("parser state blob length mismatch"));
        }

        let our_words = b.u32()? as usize;
        let mut words = Vec::with_capacity(our_words);
        for _ in 0..our_words {
            words.push(b.u32()?);
        }
        let snap_ours = CapSet::from_words(&words);
        if !snap_ours.is_subset_of(&caps.ours) {
            return Err(bad("snapshot announces capabilities we do not have"));
        }
        if !caps.ours.is_subset_of(&snap_ours) {
            warn!("snapshot lacks some of our capabilities, continuing with its set");
        }

        let peer_words = b.u32()? as usize;
        let snap_peer = if peer_words > 0 {
            let mut words = Vec::with_capacity(peer_words);
            for _ in 0..peer_words {
                words.push(b.u32()?);
            }
            Some(CapSet::from_words(&words))
        } else {
            None
        };

        let to_skip = b.u32()? as usize;
        let header = b.section(16)?;
        let type_header = b.section(MAX_PACKET_SIZE)?;
        let data = b.section(MAX_PACKET_SIZE)?;

        caps.ours = snap_ours;
        caps.peer = snap_peer;

        reader.to_skip = to_skip;
        reader.header[..header.len()].copy_from_slice(header);
        reader.header_read = header.len();
        reader.header_len = if caps
            .peer
            .map(|p| caps.ours.intersect(&p).has(crate::proto::CAP_64BITS_IDS))
            .unwrap_or(false)
        {
            16
        } else {
            12
        };

        if reader.header_read > 0 && reader.header_read == reader.header_len {
            // The main header was complete; re-derive frame sizing the same
            // way the reading path did, then refill the partial sections.
            drop(caps);
            if self.begin_frame(&mut reader).is_err() {
                return Err(bad("snapshot contains an invalid partial frame"));
            }
            if type_header.len() > reader.type_header.len()
                || data.len() > reader.data.len()
            {
                return Err(bad("partial sections exceed the frame they belong to"));
            }
            reader.type_header[..type_header.len()].copy_from_slice(type_header);
            reader.type_header_read = type_header.len();
            reader.data[..data.len()].copy_from_slice(data);
            reader.data_read = data.len();
            if reader.type_header_read == reader.type_header.len() {
                reader.phase = Phase::Data;
            }
        } else {
            if !type_header.is_empty() || !data.is_empty() {
                return Err(bad("partial sections without a complete header"));
            }
            reader.phase = Phase::Header;
        }

        let count = b.u32()?;
        if count > MAX_WRITE_BUFS {
            return Err(bad("unreasonable write buffer count in snapshot"));
        }
        for _ in 0..count {
            let buf = b.section(MAX_PACKET_SIZE)?;
            queue.push(buf.to_vec());
        }

        Ok(())
    }
}
