// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-free single-producer single-consumer packet ring over a mapped byte
// region. Variable-length packets, out-of-order reservation and commit on
// the producer side, out-of-order read and accept on the consumer side,
// stuffing across the wrap boundary.
//
// The ring itself performs no handshaking and does not monitor the lifetime
// of the underlying region; both are the job of the connection layer. One
// thread at a time may write and one thread at a time may read; reading and
// writing may overlap freely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{ChannelError, Result};
use crate::protocol::CHANNEL_VERSION;

/// Size of the ring header at the start of the region.
pub const RING_HDR_SIZE: u32 = 16;

/// Size of the per-packet header.
pub const PACKET_HDR_SIZE: u32 = 8;

/// Default time a producer waits for free space before giving up.
pub const RESERVE_TIMEOUT_MS: u64 = 1000;

/// Packet kinds on the ring.
pub const KIND_DATA: u16 = 0;
/// Filler packet pushing the write cursor past the end of the usable area.
pub const KIND_STUFFING: u16 = 1;

/// Packet states.
pub const STATE_FREE: u16 = 0;
pub const STATE_RESERVED: u16 = 1;
pub const STATE_COMMIT: u16 = 2;
pub const STATE_READ: u16 = 3;

/// Round up to the next 8-byte boundary.
#[inline]
pub const fn align8(v: u32) -> u32 {
    if v % 8 != 0 {
        v + 8 - v % 8
    } else {
        v
    }
}

// ---------------------------------------------------------------------------
// Shared layout
// ---------------------------------------------------------------------------

/// Ring header at the start of the mapped region.
///
/// `tx_pos` has a single writer (the producer), `rx_pos` a single writer
/// (the consumer); both sides read both. Word-sized atomics carry the
/// cross-process publication.
#[repr(C)]
pub(crate) struct RingHdr {
    version: AtomicU32,
    size: AtomicU32,
    tx_pos: AtomicU32,
    rx_pos: AtomicU32,
}

/// 8-byte packet header preceding every payload.
#[repr(C)]
struct PacketHdr {
    kind: AtomicU16,
    state: AtomicU16,
    size: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<RingHdr>() == RING_HDR_SIZE as usize);
const _: () = assert!(std::mem::size_of::<PacketHdr>() == PACKET_HDR_SIZE as usize);

/// Initialise the ring header of a freshly created region.
///
/// # Safety
/// `base` must point to a writable region of at least `total_size` bytes.
pub(crate) unsafe fn init_region(base: *mut u8, total_size: u32) {
    debug_assert!(total_size > RING_HDR_SIZE);
    let hdr = &*(base as *const RingHdr);
    hdr.version.store(CHANNEL_VERSION, Ordering::Relaxed);
    hdr.size.store(total_size - RING_HDR_SIZE, Ordering::Relaxed);
    hdr.tx_pos.store(0, Ordering::Relaxed);
    hdr.rx_pos.store(0, Ordering::Release);
}

/// Validate the header of an attached region and return its usable size.
///
/// # Safety
/// `base` must point to a readable region of at least `RING_HDR_SIZE` bytes.
pub(crate) unsafe fn validate_region(base: *const u8) -> Result<u32> {
    let hdr = &*(base as *const RingHdr);
    let version = hdr.version.load(Ordering::Acquire);
    if version != CHANNEL_VERSION {
        return Err(ChannelError::VersionMismatch {
            peer: version,
            local: CHANNEL_VERSION,
        });
    }
    let size = hdr.size.load(Ordering::Relaxed);
    if size <= RING_HDR_SIZE || size % 8 != 0 {
        return Err(ChannelError::InvalidRegion(format!(
            "ring size {size} is malformed"
        )));
    }
    Ok(size)
}

/// Whether the ring holds data the consumer has not yet advanced past.
/// Used by regions as the predicate before a data wait.
///
/// # Safety
/// `base` must point to a valid ring header.
pub(crate) unsafe fn has_unread(base: *const u8) -> bool {
    let hdr = &*(base as *const RingHdr);
    hdr.rx_pos.load(Ordering::Acquire) != hdr.tx_pos.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// Region abstraction
// ---------------------------------------------------------------------------

/// One direction's backing store: the mapped bytes plus the two triggers the
/// accessors use for back-pressure and data notification.
///
/// Implemented by the shared-memory region (cross-process) and by the
/// in-process buffer (tests and same-process channels).
pub trait RingRegion: Send + Sync {
    /// Pointer to the ring header at the start of the mapped area.
    fn base(&self) -> *mut u8;

    /// Signal the consumer that a commit completed.
    fn trigger_data(&self);

    /// Wait until a commit is signalled; `true` when data may be available.
    fn wait_for_data(&self, timeout_ms: u64) -> bool;

    /// Signal the producer that space was freed.
    fn trigger_space(&self);

    /// Wait until space is freed; `true` when woken, `false` on timeout.
    fn wait_for_space(&self, timeout_ms: u64) -> bool;
}

// ---------------------------------------------------------------------------
// Producer accessor
// ---------------------------------------------------------------------------

/// Writing accessor over one ring.
pub struct RingTx {
    region: Arc<dyn RingRegion>,
    size: u32,
    reserved: Mutex<VecDeque<u32>>,
    cancel: AtomicBool,
    block_reserve: AtomicBool,
}

impl RingTx {
    /// Attach the producer side to a region whose header is already valid.
    pub fn new(region: Arc<dyn RingRegion>) -> Result<Self> {
        let size = unsafe { validate_region(region.base()) }?;
        Ok(Self {
            region,
            size,
            reserved: Mutex::new(VecDeque::new()),
            cancel: AtomicBool::new(false),
            block_reserve: AtomicBool::new(false),
        })
    }

    /// Usable byte count of the ring.
    pub fn size(&self) -> u32 {
        self.size
    }

    fn hdr(&self) -> &RingHdr {
        unsafe { &*(self.region.base() as *const RingHdr) }
    }

    /// # Safety
    /// `off` must be a packet offset within the usable area.
    unsafe fn packet(&self, off: u32) -> &PacketHdr {
        debug_assert!(off + PACKET_HDR_SIZE <= self.size);
        &*(self
            .region
            .base()
            .add((RING_HDR_SIZE + off) as usize) as *const PacketHdr)
    }

    fn payload_ptr(&self, off: u32) -> *mut u8 {
        unsafe {
            self.region
                .base()
                .add((RING_HDR_SIZE + off + PACKET_HDR_SIZE) as usize)
        }
    }

    /// Reserve space for a packet of `n` payload bytes.
    ///
    /// The returned reservation must be committed (dropping commits it
    /// automatically). Performance degrades when `n` approaches the ring
    /// size; as a rule keep packets at most a quarter of it.
    pub fn reserve(&self, n: u32, timeout_ms: u64) -> Result<Reservation<'_>> {
        if self.block_reserve.load(Ordering::Acquire) {
            return Err(ChannelError::Cancelled);
        }
        if n > self.size - PACKET_HDR_SIZE {
            return Err(ChannelError::InvalidSize {
                requested: n,
                capacity: self.size - PACKET_HDR_SIZE,
            });
        }

        let need = align8(n + PACKET_HDR_SIZE);

        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(ChannelError::Cancelled);
            }

            let mut queue = self.reserved.lock().unwrap();

            // Effective write position: tail of the reservation queue, or
            // the header cursor when nothing is outstanding.
            let rx_pos = self.hdr().rx_pos.load(Ordering::Acquire);
            let mut tx_pos = self.hdr().tx_pos.load(Ordering::Relaxed);
            if let Some(&back) = queue.back() {
                let pkt = unsafe { self.packet(back) };
                tx_pos = align8(back + PACKET_HDR_SIZE + pkt.size.load(Ordering::Relaxed));
            }

            // Free space in the forward segment. When the read cursor is
            // ahead, writing may run up to one byte short of it; otherwise
            // the tail of the buffer is available, falling back to the
            // front (behind the read cursor) with a stuffing packet.
            let mut stuffing_needed = false;
            let max = if rx_pos > tx_pos {
                rx_pos - tx_pos - 1
            } else {
                let mut max = self.size.saturating_sub(tx_pos);
                if rx_pos == 0 {
                    max = max.saturating_sub(1);
                } else if max < need {
                    stuffing_needed = true;
                    max = rx_pos - 1;
                }
                max
            };

            if need <= max {
                let mut off = tx_pos;
                if stuffing_needed {
                    // Fill the tail, but only when a header still fits;
                    // a shorter tail is zeroed and never parsed.
                    if self.size - off >= PACKET_HDR_SIZE {
                        let stuff = unsafe { self.packet(off) };
                        stuff.kind.store(KIND_STUFFING, Ordering::Relaxed);
                        stuff
                            .size
                            .store(self.size - off - PACKET_HDR_SIZE, Ordering::Relaxed);
                        stuff.state.store(STATE_COMMIT, Ordering::Release);
                    } else if off < self.size {
                        unsafe {
                            std::ptr::write_bytes(
                                self.region.base().add((RING_HDR_SIZE + off) as usize),
                                0,
                                (self.size - off) as usize,
                            );
                        }
                    }
                    off = 0;
                }

                let pkt = unsafe { self.packet(off) };
                pkt.kind.store(KIND_DATA, Ordering::Relaxed);
                pkt.size.store(n, Ordering::Relaxed);
                pkt.state.store(STATE_RESERVED, Ordering::Release);
                queue.push_back(off);

                return Ok(Reservation {
                    tx: self,
                    offset: off,
                    len: n,
                    committed: false,
                });
            }

            drop(queue);

            if !self.region.wait_for_space(timeout_ms) {
                return Err(ChannelError::ChannelFull(timeout_ms));
            }
        }
    }

    /// Reserve with the default timeout, copy `data` in place and commit.
    pub fn try_write(&self, data: &[u8]) -> Result<()> {
        let mut packet = self.reserve(data.len() as u32, RESERVE_TIMEOUT_MS)?;
        packet.payload().copy_from_slice(data);
        packet.commit();
        Ok(())
    }

    /// Abort any blocked or future reserve. Cleared by [`reset_rx`].
    ///
    /// The short sleep gives a waiter blocked on the free-space trigger time
    /// to observe the flag before the caller proceeds with teardown.
    ///
    /// [`reset_rx`]: RingTx::reset_rx
    pub fn cancel_send(&self) {
        self.cancel.store(true, Ordering::Release);
        self.region.trigger_space();
        std::thread::sleep(Duration::from_millis(10));
    }

    /// Whether the current send job has been cancelled.
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Skip any sent-but-unread data and clear the cancel flag. Used when a
    /// peer restarts and the stale ring content must not be replayed.
    pub fn reset_rx(&self) {
        let hdr = self.hdr();
        let tx = hdr.tx_pos.load(Ordering::Acquire);
        hdr.rx_pos.store(tx, Ordering::Release);
        self.cancel.store(false, Ordering::Release);
    }

    fn commit_packet(&self, off: u32) {
        let pkt = unsafe { self.packet(off) };
        if pkt.kind.load(Ordering::Relaxed) != KIND_DATA
            || pkt.state.load(Ordering::Relaxed) != STATE_RESERVED
        {
            return;
        }
        pkt.state.store(STATE_COMMIT, Ordering::Release);

        // Advance the write cursor over the contiguous prefix of committed
        // packets only; a still-reserved packet holds everything behind it.
        let mut queue = self.reserved.lock().unwrap();
        let hdr = self.hdr();
        let mut tx_pos = hdr.tx_pos.load(Ordering::Relaxed);
        while let Some(&front) = queue.front() {
            let p = unsafe { self.packet(front) };
            if p.state.load(Ordering::Acquire) != STATE_COMMIT {
                break;
            }
            tx_pos = align8(front + PACKET_HDR_SIZE + p.size.load(Ordering::Relaxed));
            if tx_pos >= self.size {
                tx_pos = 0;
            }
            queue.pop_front();
        }
        hdr.tx_pos.store(tx_pos, Ordering::Release);
        drop(queue);

        self.region.trigger_data();
    }
}

impl Drop for RingTx {
    fn drop(&mut self) {
        self.block_reserve.store(true, Ordering::Release);

        // Wait until every outstanding reservation reached commit state and
        // advance the write cursor past them before the region goes away.
        loop {
            let mut queue = self.reserved.lock().unwrap();
            let Some(&front) = queue.front() else {
                break;
            };
            let pkt = unsafe { self.packet(front) };
            if pkt.state.load(Ordering::Acquire) != STATE_COMMIT {
                drop(queue);
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            let mut tx_pos = align8(front + PACKET_HDR_SIZE + pkt.size.load(Ordering::Relaxed));
            if tx_pos >= self.size {
                tx_pos = 0;
            }
            queue.pop_front();
            self.hdr().tx_pos.store(tx_pos, Ordering::Release);
        }
    }
}

/// A reserved, not yet committed packet. Committing (or dropping) makes the
/// payload visible to the consumer once every earlier reservation has also
/// committed.
pub struct Reservation<'a> {
    tx: &'a RingTx,
    offset: u32,
    len: u32,
    committed: bool,
}

impl Reservation<'_> {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The writable payload bytes of this packet.
    pub fn payload(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.tx.payload_ptr(self.offset), self.len as usize) }
    }

    /// Publish the packet.
    pub fn commit(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.committed {
            self.committed = true;
            self.tx.commit_packet(self.offset);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// Consumer accessor
// ---------------------------------------------------------------------------

/// Reading accessor over one ring.
pub struct RingRx {
    region: Arc<dyn RingRegion>,
    size: u32,
    read_access: Mutex<()>,
}

impl RingRx {
    /// Attach the consumer side to a region whose header is already valid.
    pub fn new(region: Arc<dyn RingRegion>) -> Result<Self> {
        let size = unsafe { validate_region(region.base()) }?;
        Ok(Self {
            region,
            size,
            read_access: Mutex::new(()),
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn hdr(&self) -> &RingHdr {
        unsafe { &*(self.region.base() as *const RingHdr) }
    }

    /// # Safety
    /// `off` must be a packet offset within the usable area.
    unsafe fn packet(&self, off: u32) -> &PacketHdr {
        debug_assert!(off + PACKET_HDR_SIZE <= self.size);
        &*(self
            .region
            .base()
            .add((RING_HDR_SIZE + off) as usize) as *const PacketHdr)
    }

    fn payload_ptr(&self, off: u32) -> *const u8 {
        unsafe {
            self.region
                .base()
                .add((RING_HDR_SIZE + off + PACKET_HDR_SIZE) as usize)
        }
    }

    /// Block until the producer signals a commit, up to `timeout_ms`.
    pub fn wait_for_data(&self, timeout_ms: u64) -> bool {
        self.region.wait_for_data(timeout_ms)
    }

    /// Return the first committed data packet after the read cursor, or
    /// `None` when no packet is currently readable.
    ///
    /// Packets in `read` or `free` state and committed stuffing are skipped;
    /// a `reserved` packet ends the scan (it is not yet visible).
    pub fn try_read(&self) -> Result<Option<ReadHandle<'_>>> {
        let _guard = self.read_access.lock().unwrap();

        let hdr = self.hdr();
        let mut rx_pos = hdr.rx_pos.load(Ordering::Relaxed);
        let tx_pos = hdr.tx_pos.load(Ordering::Acquire);

        while rx_pos != tx_pos {
            if rx_pos > self.size {
                rx_pos -= self.size;
                continue;
            }

            // No room for a header before the end: wrap, unless the write
            // cursor has not come around yet. The tail bytes are either a
            // stuffing remainder or zero fill and are never parsed.
            if self.size - rx_pos < PACKET_HDR_SIZE {
                if tx_pos >= rx_pos {
                    break;
                }
                rx_pos = 0;
                continue;
            }

            let pkt = unsafe { self.packet(rx_pos) };
            let state = pkt.state.load(Ordering::Acquire);
            let kind = pkt.kind.load(Ordering::Relaxed);
            let psize = pkt.size.load(Ordering::Relaxed);

            if kind > KIND_STUFFING || state > STATE_READ {
                return Err(ChannelError::Corrupt(rx_pos));
            }
            if rx_pos + PACKET_HDR_SIZE + psize > self.size {
                return Err(ChannelError::Corrupt(rx_pos));
            }

            match state {
                STATE_COMMIT if kind == KIND_DATA => {
                    pkt.state.store(STATE_READ, Ordering::Release);
                    return Ok(Some(ReadHandle {
                        rx: self,
                        offset: rx_pos,
                        len: psize,
                        released: false,
                    }));
                }
                STATE_COMMIT | STATE_READ | STATE_FREE => {
                    rx_pos = align8(rx_pos + PACKET_HDR_SIZE + psize);
                }
                _ => break, // reserved: not yet published
            }
        }

        Ok(None)
    }

    fn release_packet(&self, off: u32) {
        {
            let _guard = self.read_access.lock().unwrap();
            let pkt = unsafe { self.packet(off) };
            pkt.state.store(STATE_FREE, Ordering::Release);
        }
        self.release_scan();
    }

    /// Advance the read cursor over the contiguous prefix of freed data
    /// packets and stuffing, then signal the producer.
    fn release_scan(&self) {
        let _guard = self.read_access.lock().unwrap();

        let hdr = self.hdr();
        let mut rx_pos = hdr.rx_pos.load(Ordering::Relaxed);
        let tx_pos = hdr.tx_pos.load(Ordering::Acquire);

        while rx_pos != tx_pos {
            if rx_pos > self.size {
                rx_pos -= self.size;
                continue;
            }
            if self.size - rx_pos < PACKET_HDR_SIZE {
                if tx_pos >= rx_pos {
                    break;
                }
                rx_pos = 0;
                continue;
            }

            let pkt = unsafe { self.packet(rx_pos) };
            let state = pkt.state.load(Ordering::Acquire);
            let kind = pkt.kind.load(Ordering::Relaxed);
            if kind == KIND_DATA && state != STATE_FREE {
                break;
            }
            rx_pos = align8(rx_pos + PACKET_HDR_SIZE + pkt.size.load(Ordering::Relaxed));
        }

        hdr.rx_pos.store(rx_pos, Ordering::Release);
        drop(_guard);

        self.region.trigger_space();
    }
}

/// A borrowed view of one committed packet. Accepting (or dropping) frees
/// the slot and advances the read cursor over every released predecessor.
pub struct ReadHandle<'a> {
    rx: &'a RingRx,
    offset: u32,
    len: u32,
    released: bool,
}

impl ReadHandle<'_> {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The payload bytes of this packet.
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.rx.payload_ptr(self.offset), self.len as usize) }
    }

    /// Release the slot for overwriting.
    pub fn accept(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.released {
            self.released = true;
            self.rx.release_packet(self.offset);
        }
    }
}

impl Drop for ReadHandle<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align8_boundaries() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
        assert_eq!(align8(13), 16);
        assert_eq!(align8(16), 16);
    }

    #[test]
    fn header_sizes_are_fixed() {
        assert_eq!(std::mem::size_of::<RingHdr>(), 16);
        assert_eq!(std::mem::size_of::<PacketHdr>(), 8);
    }
}
