//! Reliable chunking for bandwidth-limited transports: slices a `lob::Packet`
//! into fixed-size frames and rebuilds it losslessly on the other end, using
//! an in-band rolling hash (rather than sequence numbers) to acknowledge
//! progress and detect drops.
//!
//! Every frame is `size + 4` bytes: `size` bytes of payload followed by a
//! 4-byte little-endian hash trailer. A frame is one of two shapes:
//!
//! - **data frame**: trailer commits to the payload and every prior data
//!   frame's hash, chained from a rolling base. The final frame of a packet
//!   is shorter than `size`; its last payload byte holds the true length.
//! - **meta frame**: trailer is simply `murmur(payload)`, which can never
//!   collide with a data-frame hash once at least one real byte has flowed
//!   (the chain always folds in the frame index). A meta frame carries the
//!   sender's ack state (what it has received, what it has sent) in its
//!   first 8 payload bytes, and optionally a small metadata blob after that.
//!
//! Exactly one packet is in flight per direction at a time; queued packets
//! wait their turn.

use std::collections::VecDeque;

use lob::{LobError, Packet};

pub const MIN_PAYLOAD_SIZE: u8 = 12;
pub const MAX_PAYLOAD_SIZE: u8 = 124;
const ACK_HEADER_LEN: usize = 8;
const META_RESERVED_LEN: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum FramesError {
    #[error("frame payload size {0} outside [12,124]")]
    InvalidSize(u8),
    #[error("frame is {got} bytes, expected {want}")]
    WrongFrameLength { got: usize, want: usize },
    #[error("ack did not match any offset in our outbound stream, latching")]
    AckMismatch,
    #[error("reassembled packet failed to parse: {0}")]
    Reassembly(#[from] LobError),
}

struct CachedFrame {
    data: Vec<u8>,
    hash: u32,
}

/// One direction's worth of chunking state for a single peer. Holds at most
/// one packet mid-flight in each direction; anything else queued waits.
pub struct Frames {
    size: u8,
    err: bool,
    inbase: u32,
    outbase: u32,
    in_count: u32,
    out: u32,
    flush: bool,
    cache: Vec<CachedFrame>,
    outbox: VecDeque<Packet>,
    inbox: VecDeque<Packet>,
}

impl Frames {
    pub fn new(payload_size: u8) -> Result<Self, FramesError> {
        if payload_size < MIN_PAYLOAD_SIZE || payload_size > MAX_PAYLOAD_SIZE {
            return Err(FramesError::InvalidSize(payload_size));
        }
        Ok(Frames {
            size: payload_size,
            err: false,
            inbase: 42,
            outbase: 42,
            in_count: 0,
            out: 0,
            flush: false,
            cache: Vec::new(),
            outbox: VecDeque::new(),
            inbox: VecDeque::new(),
        })
    }

    pub fn frame_len(&self) -> usize {
        self.size as usize + 4
    }

    /// Drop all chunking progress and force a resync on the next frame sent
    /// or received, without touching queued packets.
    pub fn clear(&mut self) {
        self.err = false;
        self.inbase = 42;
        self.outbase = 42;
        self.in_count = 0;
        self.out = 0;
        self.cache.clear();
        self.flush = true;
    }

    pub fn is_latched(&self) -> bool {
        self.err
    }

    /// Queue a packet to send, or pass `None` to force an immediate
    /// meta-frame flush (e.g. to ack a received packet with nothing of our
    /// own queued).
    pub fn send(&mut self, packet: Option<Packet>) {
        match packet {
            Some(p) => self.outbox.push_back(p),
            None => self.flush = true,
        }
    }

    /// Take the next fully reassembled inbound packet, if any.
    pub fn receive(&mut self) -> Option<Packet> {
        self.inbox.pop_front()
    }

    /// True if there is anything to send: a forced flush or a queued packet.
    pub fn waiting(&self) -> bool {
        self.flush || !self.outbox.is_empty()
    }

    /// True if the next frame we'd build still carries real payload (as
    /// opposed to degrading into a bare meta/ack frame).
    pub fn pending(&self) -> bool {
        if self.flush {
            return false;
        }
        match self.outbox.front() {
            Some(front) => (self.out as usize * self.size as usize) <= front.len(),
            None => false,
        }
    }

    /// True if we're still waiting on more frames from the remote side
    /// before the current inbound packet completes.
    pub fn await_more(&self) -> bool {
        if !self.cache.is_empty() {
            return true;
        }
        match self.outbox.front() {
            Some(front) => (self.out as usize * self.size as usize) > front.len(),
            None => false,
        }
    }

    pub fn busy(&self) -> bool {
        self.waiting() || self.await_more()
    }

    /// Bytes of the front outbound packet still unsent, for stats/backpressure.
    pub fn out_len(&self) -> usize {
        match self.outbox.front() {
            Some(front) => front.len().saturating_sub(self.out as usize * self.size as usize),
            None => 0,
        }
    }

    /// Bytes already reassembled for the inbound packet in progress.
    pub fn in_len(&self) -> usize {
        self.cache.len() * self.size as usize
    }

    /// Build the next outbound frame. `meta` is attached only when this
    /// call degrades to (or is forced into) a meta frame.
    pub fn next_outbound(&mut self, meta: Option<&[u8]>) -> Vec<u8> {
        let size = self.size as usize;
        let size_u32 = self.size as u32;
        let front_bytes = self.outbox.front().map(|p| p.to_bytes());
        let len = front_bytes.as_ref().map(|b| b.len() as u32).unwrap_or(0);

        let hash_so_far = match &front_bytes {
            Some(bin) => rehash_up_to(self.outbase, bin, len, self.out, size_u32),
            None => self.outbase,
        };

        let mut frame = vec![0u8; size + 4];

        let degrade_to_meta = self.flush || len == 0 || (self.out * size_u32) > len;
        if degrade_to_meta {
            self.flush = true;
            let inlast = self.cache.last().map(|c| c.hash).unwrap_or(self.inbase);
            frame[0..4].copy_from_slice(&inlast.to_le_bytes());
            frame[4..8].copy_from_slice(&hash_so_far.to_le_bytes());
            if let Some(m) = meta {
                let n = m.len().min(size.saturating_sub(META_RESERVED_LEN));
                frame[META_RESERVED_LEN..META_RESERVED_LEN + n].copy_from_slice(&m[..n]);
            }
            let trailer = murmur32(&frame[..size], 0);
            frame[size..].copy_from_slice(&trailer.to_le_bytes());
            return frame;
        }

        let bin = front_bytes.expect("len > 0 implies a front packet");
        let at = (self.out * size_u32) as usize;
        let mut chunk_len = size;
        if at + size > bin.len() {
            chunk_len = bin.len() - at;
            frame[size - 1] = chunk_len as u8;
        }
        frame[..chunk_len].copy_from_slice(&bin[at..at + chunk_len]);
        let hash = chain_step(hash_so_far, &frame[..chunk_len]).wrapping_add(self.out);
        frame[size..].copy_from_slice(&hash.to_le_bytes());
        frame
    }

    /// Advance state after a frame built by [`Frames::next_outbound`] has
    /// actually been written to the transport. Returns `true` if another
    /// frame of the same packet is still waiting to go out.
    pub fn mark_sent(&mut self) -> bool {
        let size_u32 = self.size as u32;
        let len = self.outbox.front().map(|p| p.len() as u32).unwrap_or(0);
        let at = self.out * size_u32;

        if self.flush || len == 0 || at > len {
            self.flush = false;
            return false;
        }

        let chunk_len = if at + size_u32 > len { len - at } else { size_u32 };
        self.out += 1;
        let _ = chunk_len;
        (self.out * size_u32) <= len
    }

    /// Feed one received frame. Returns the attached metadata if this was a
    /// meta frame, or `None` for a data frame (whether or not it completed
    /// the inbound packet — check [`Frames::receive`] for that).
    pub fn receive_frame(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, FramesError> {
        if self.err {
            return Err(FramesError::AckMismatch);
        }
        let size = self.size as usize;
        if frame.len() != size + 4 {
            return Err(FramesError::WrongFrameLength { got: frame.len(), want: size + 4 });
        }

        let payload = &frame[..size];
        let trailer = u32::from_le_bytes(frame[size..size + 4].try_into().unwrap());
        let meta_hash = murmur32(payload, 0);
        let inlast = self.cache.last().map(|c| c.hash).unwrap_or(self.inbase);

        if trailer == meta_hash {
            return self.receive_meta(frame).map(Some);
        }

        if trailer == self.inbase || self.cache.iter().any(|c| c.hash == trailer) {
            // Already have this one; ignore.
            return Ok(None);
        }

        let full_hash = chain_step(inlast, payload).wrapping_add(self.in_count);
        if trailer == full_hash {
            self.cache.push(CachedFrame { data: payload.to_vec(), hash: trailer });
            self.in_count += 1;
            self.flush = false;
            return Ok(None);
        }

        let tail = payload[size - 1] as usize;
        if tail >= size {
            self.flush = true;
            return Ok(None);
        }
        let tail_hash = chain_step(inlast, &payload[..tail]).wrapping_add(self.in_count);
        if trailer != tail_hash {
            self.flush = true;
            return Ok(None);
        }

        self.flush = true;
        self.inbase = trailer;
        let mut buf = Vec::with_capacity(self.cache.len() * size + tail);
        for c in self.cache.drain(..) {
            buf.extend_from_slice(&c.data);
        }
        buf.extend_from_slice(&payload[..tail]);
        self.in_count = 0;
        let packet = Packet::parse(&buf)?;
        self.inbox.push_back(packet);
        Ok(None)
    }

    fn receive_meta(&mut self, frame: &[u8]) -> Result<Vec<u8>, FramesError> {
        let size = self.size as usize;
        let size_u32 = self.size as u32;
        let inlast = self.cache.last().map(|c| c.hash).unwrap_or(self.inbase);

        let rxd = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        let rxd2 = u32::from_le_bytes(frame[4..8].try_into().unwrap());

        let bin = self.outbox.front().map(|p| p.to_bytes());
        let len = bin.as_ref().map(|b| b.len() as u32).unwrap_or(0);

        let mut rxs = self.outbase;
        let mut next: u32 = 0;
        loop {
            if rxd == rxs {
                self.out = next;
                break;
            }
            let at = next * size_u32;
            let chunk: &[u8] = match &bin {
                Some(b) if (at as usize) <= b.len() => {
                    let chunk_len = if len.saturating_sub(at) < size_u32 { len - at } else { size_u32 };
                    &b[at as usize..(at + chunk_len) as usize]
                }
                _ => &[],
            };
            rxs = chain_step(rxs, chunk).wrapping_add(next);
            if len < size_u32 {
                break;
            }
            next += 1;
            if next * size_u32 > len {
                break;
            }
        }
        if rxd != rxs {
            self.err = true;
            log::warn!("ack {:#010x} matched no offset in our outbound stream, latching", rxd);
            return Err(FramesError::AckMismatch);
        }

        if (self.out * size_u32) > len {
            self.out = 0;
            self.outbase = rxd;
            self.outbox.pop_front();
        }

        if rxd2 != inlast {
            self.flush = true;
        }

        Ok(frame[META_RESERVED_LEN..size].to_vec())
    }
}

fn chain_step(hash: u32, chunk: &[u8]) -> u32 {
    hash ^ murmur32(chunk, 0)
}

fn rehash_up_to(base: u32, bin: &[u8], len: u32, upto_frame: u32, size: u32) -> u32 {
    let mut hash = base;
    let mut i = 0u32;
    let mut at = 0u32;
    while at < len && i < upto_frame {
        let chunk_len = if len - at < size { len - at } else { size };
        let at_u = at as usize;
        let chunk = &bin[at_u..at_u + chunk_len as usize];
        hash = chain_step(hash, chunk).wrapping_add(i);
        i += 1;
        at += size;
    }
    hash
}

/// 32-bit MurmurHash3 (x86, 32-bit variant), seed 0 throughout this crate.
fn murmur32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h1 = seed;
    let len = data.len();
    let nblocks = len / 4;

    for i in 0..nblocks {
        let mut k1 = u32::from_le_bytes([
            data[i * 4],
            data[i * 4 + 1],
            data[i * 4 + 2],
            data[i * 4 + 3],
        ]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = &data[nblocks * 4..];
    let mut k1: u32 = 0;
    match tail.len() {
        3 => {
            k1 ^= (tail[2] as u32) << 16;
            k1 ^= (tail[1] as u32) << 8;
            k1 ^= tail[0] as u32;
            h1 ^= k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        }
        2 => {
            k1 ^= (tail[1] as u32) << 8;
            k1 ^= tail[0] as u32;
            h1 ^= k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        }
        1 => {
            k1 ^= tail[0] as u32;
            h1 ^= k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        }
        _ => {}
    }

    h1 ^= len as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive one side's outbox into the other side's inbox until both are
    /// idle, alternating directions like a real transport would.
    fn pump(a: &mut Frames, b: &mut Frames) {
        for _ in 0..64 {
            if !a.busy() && !b.busy() {
                break;
            }
            let fa = a.next_outbound(None);
            a.mark_sent();
            if let Some(_meta) = b.receive_frame(&fa).unwrap() {
                // meta frame, nothing further to do here
            }

            let fb = b.next_outbound(None);
            b.mark_sent();
            if let Some(_meta) = a.receive_frame(&fb).unwrap() {
            }
        }
    }

    #[test]
    fn rejects_out_of_range_payload_size() {
        assert!(Frames::new(11).is_err());
        assert!(Frames::new(125).is_err());
        assert!(Frames::new(12).is_ok());
        assert!(Frames::new(124).is_ok());
    }

    #[test]
    fn small_packet_round_trips_in_one_frame() {
        let mut a = Frames::new(60).unwrap();
        let mut b = Frames::new(60).unwrap();

        a.send(Some(Packet::channel(b"hello mesh".to_vec())));
        pump(&mut a, &mut b);

        let got = b.receive().expect("packet should have arrived");
        assert_eq!(got.body(), b"hello mesh");
    }

    #[test]
    fn packet_larger_than_payload_spans_multiple_frames() {
        let mut a = Frames::new(12).unwrap();
        let mut b = Frames::new(12).unwrap();

        let body: Vec<u8> = (0u8..=200).collect();
        a.send(Some(Packet::channel(body.clone())));
        pump(&mut a, &mut b);

        let got = b.receive().expect("multi-frame packet should reassemble");
        assert_eq!(got.body(), &body[..]);
    }

    #[test]
    fn duplicate_frame_delivery_is_idempotent() {
        let mut a = Frames::new(16).unwrap();
        let mut b = Frames::new(16).unwrap();

        a.send(Some(Packet::channel(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10])));
        let f0 = a.next_outbound(None);
        a.mark_sent();

        b.receive_frame(&f0).unwrap();
        b.receive_frame(&f0).unwrap();
        b.receive_frame(&f0).unwrap();

        assert_eq!(b.in_len(), 16);
    }

    #[test]
    fn clear_forces_a_resync_without_dropping_queued_packets() {
        let mut a = Frames::new(20).unwrap();
        a.send(Some(Packet::channel(vec![9; 5])));
        let _ = a.next_outbound(None);
        a.mark_sent();

        a.clear();
        assert!(a.waiting());
        assert_eq!(a.out_len(), 2 + 5);
    }

    #[test]
    fn three_packets_with_varied_sizes_all_arrive_in_order() {
        let mut a = Frames::new(60).unwrap();
        let mut b = Frames::new(60).unwrap();

        let bodies: Vec<Vec<u8>> = vec![
            vec![1; 7],
            vec![2; 179],
            vec![3; 1024],
        ];

        for body in &bodies {
            a.send(Some(Packet::channel(body.clone())));
            pump(&mut a, &mut b);
            let got = b.receive().expect("packet should arrive before the next is sent");
            assert_eq!(&got.body()[..], &body[..]);
        }
    }

    #[test]
    fn survives_every_third_frame_dropped_across_varied_packet_sizes() {
        let mut a = Frames::new(60).unwrap();
        let mut b = Frames::new(60).unwrap();

        for body in [vec![1u8; 7], vec![2u8; 179], vec![3u8; 1024]] {
            a.send(Some(Packet::channel(body.clone())));

            let mut tick = 0u32;
            let mut delivered = None;
            for _ in 0..256 {
                tick += 1;
                let fa = a.next_outbound(None);
                a.mark_sent();
                if tick % 3 != 0 {
                    b.receive_frame(&fa).unwrap();
                }

                tick += 1;
                let fb = b.next_outbound(None);
                b.mark_sent();
                if tick % 3 != 0 {
                    a.receive_frame(&fb).unwrap();
                }

                if let Some(got) = b.receive() {
                    delivered = Some(got);
                    break;
                }
            }

            let got = delivered.expect("packet should eventually arrive despite dropped frames");
            assert_eq!(&got.body()[..], &body[..]);
        }
    }

    #[test]
    fn clear_forces_a_resync_and_later_packets_still_round_trip() {
        let mut a = Frames::new(20).unwrap();
        let mut b = Frames::new(20).unwrap();

        a.send(Some(Packet::channel(vec![5u8; 50])));
        let f0 = a.next_outbound(None);
        a.mark_sent();
        b.receive_frame(&f0).unwrap();
        let f1 = a.next_outbound(None);
        a.mark_sent();
        b.receive_frame(&f1).unwrap();

        // Sender forgets all progress and rewinds to frame 0; the still
        // queued packet is retransmitted from scratch rather than lost.
        a.clear();
        assert!(a.waiting());

        pump(&mut a, &mut b);
        let got = b.receive().expect("retransmission from scratch should still complete the packet");
        assert_eq!(got.body(), &vec![5u8; 50][..]);

        a.send(Some(Packet::channel(b"fresh start".to_vec())));
        pump(&mut a, &mut b);
        let got = b.receive().expect("a fresh packet sent after clear() should still round-trip");
        assert_eq!(got.body(), b"fresh start");
    }

    #[test]
    fn murmur32_matches_known_vectors() {
        // Well-known MurmurHash3_x86_32 seed-0 test vectors.
        assert_eq!(murmur32(b"", 0), 0);
        assert_eq!(murmur32(b"test", 0), 0xba6bd213);
    }
}
