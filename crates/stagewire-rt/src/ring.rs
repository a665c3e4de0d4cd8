//! Framed single-producer/single-consumer byte ring.
//!
//! The control header and the data area are laid out `repr(C)` so the whole
//! ring can live inside a shared-memory mapping with one process writing and
//! another reading. Writes are staged locally and only become visible to the
//! reader after [`Ring::commit_write`], so the reader never observes half a
//! frame.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// Capacity of the RT control ring. One audio cycle's worth of events fits
/// with room to spare.
pub const SMALL_RING_SIZE: usize = 4 * 1024;
/// Capacity of the non-RT client ring.
pub const BIG_RING_SIZE: usize = 512 * 1024;
/// Capacity of the non-RT server ring, which carries chunk and custom data.
pub const HUGE_RING_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("not enough data committed for the requested read")]
    NotEnoughData,
    #[error("custom data length {0} exceeds ring capacity")]
    Oversized(u32),
}

/// Shared control header. Head and tail are free-running `u32` counters, so
/// the data capacity must be a power of two.
#[repr(C)]
pub struct RingHeader {
    head: AtomicU32,
    tail: AtomicU32,
    wrtn: u32,
    invalidated: u32,
}

/// A view over a ring header plus data area at a fixed location in memory.
///
/// The pointer may target process-local memory ([`RingMemory`]) or a mapped
/// shared region. Exactly one side may write and one side may read; the
/// caller upholds that discipline, the ring only guarantees frame atomicity.
pub struct Ring {
    header: *mut RingHeader,
    data: *mut u8,
    mask: u32,
}

unsafe impl Send for Ring {}

impl Ring {
    /// Bytes a ring with `capacity` data bytes occupies in memory.
    pub const fn required_bytes(capacity: usize) -> usize {
        std::mem::size_of::<RingHeader>() + capacity
    }

    /// Builds a view over `capacity + size_of::<RingHeader>()` bytes at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid, suitably aligned for [`RingHeader`] and live for
    /// the lifetime of the view. `capacity` must be a power of two and match
    /// the value used on the other side of the channel. Pass `init = true`
    /// from exactly one side, before the other attaches.
    pub unsafe fn attach(ptr: *mut u8, capacity: usize, init: bool) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let header = ptr as *mut RingHeader;
        if init {
            std::ptr::write(
                header,
                RingHeader {
                    head: AtomicU32::new(0),
                    tail: AtomicU32::new(0),
                    wrtn: 0,
                    invalidated: 0,
                },
            );
        }
        Self {
            header,
            data: ptr.add(std::mem::size_of::<RingHeader>()),
            mask: (capacity - 1) as u32,
        }
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    fn capacity(&self) -> u32 {
        self.mask + 1
    }

    // ---- writer side ----------------------------------------------------

    fn stage(&mut self, bytes: &[u8]) -> bool {
        let header = unsafe { &mut *self.header };
        if header.invalidated != 0 {
            return false;
        }

        let tail = header.tail.load(Ordering::Acquire);
        let staged = header.wrtn.wrapping_sub(tail);
        let free = self.capacity() - staged;
        if (bytes.len() as u32) > free {
            header.invalidated = 1;
            return false;
        }

        let start = header.wrtn & self.mask;
        let until_wrap = (self.capacity() - start) as usize;
        let first = bytes.len().min(until_wrap);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(start as usize), first);
            if first < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    self.data,
                    bytes.len() - first,
                );
            }
        }
        header.wrtn = header.wrtn.wrapping_add(bytes.len() as u32);
        true
    }

    /// Publishes every write staged since the previous commit. Returns false
    /// and discards the whole frame if any staged write overflowed; the
    /// reader never sees a partial frame either way.
    pub fn commit_write(&mut self) -> bool {
        let header = unsafe { &mut *self.header };
        if header.invalidated != 0 {
            header.wrtn = header.head.load(Ordering::Relaxed);
            header.invalidated = 0;
            return false;
        }
        header.head.store(header.wrtn, Ordering::Release);
        true
    }

    pub fn write_opcode(&mut self, opcode: u32) -> bool {
        self.write_u32(opcode)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> bool {
        self.stage(bytes)
    }

    pub fn write_u8(&mut self, value: u8) -> bool {
        self.stage(&[value])
    }

    pub fn write_bool(&mut self, value: bool) -> bool {
        self.write_u8(value as u8)
    }

    pub fn write_i16(&mut self, value: i16) -> bool {
        self.stage(&value.to_ne_bytes())
    }

    pub fn write_u16(&mut self, value: u16) -> bool {
        self.stage(&value.to_ne_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> bool {
        self.stage(&value.to_ne_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> bool {
        self.stage(&value.to_ne_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> bool {
        self.stage(&value.to_ne_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> bool {
        self.stage(&value.to_ne_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> bool {
        self.stage(&value.to_ne_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> bool {
        self.stage(&value.to_ne_bytes())
    }

    /// Length-prefixed byte block, the carrier for strings and chunk data.
    pub fn write_custom_data(&mut self, bytes: &[u8]) -> bool {
        self.write_u32(bytes.len() as u32) && self.stage(bytes)
    }

    pub fn write_str(&mut self, value: &str) -> bool {
        self.write_custom_data(value.as_bytes())
    }

    // ---- reader side ----------------------------------------------------

    pub fn is_data_available_for_reading(&self) -> bool {
        let header = self.header();
        header.head.load(Ordering::Acquire) != header.tail.load(Ordering::Relaxed)
    }

    fn consume(&mut self, out: &mut [u8]) -> Result<(), RingError> {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Relaxed);
        let available = head.wrapping_sub(tail);
        if (out.len() as u32) > available {
            return Err(RingError::NotEnoughData);
        }

        let start = tail & self.mask;
        let until_wrap = (self.capacity() - start) as usize;
        let first = out.len().min(until_wrap);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.add(start as usize), out.as_mut_ptr(), first);
            if first < out.len() {
                std::ptr::copy_nonoverlapping(
                    self.data,
                    out.as_mut_ptr().add(first),
                    out.len() - first,
                );
            }
        }
        header
            .tail
            .store(tail.wrapping_add(out.len() as u32), Ordering::Release);
        Ok(())
    }

    pub fn read_opcode(&mut self) -> Result<u32, RingError> {
        self.read_u32()
    }

    pub fn read_u8(&mut self) -> Result<u8, RingError> {
        let mut buf = [0u8; 1];
        self.consume(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, RingError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, RingError> {
        let mut buf = [0u8; 2];
        self.consume(&mut buf)?;
        Ok(i16::from_ne_bytes(buf))
    }

    pub fn read_u16(&mut self) -> Result<u16, RingError> {
        let mut buf = [0u8; 2];
        self.consume(&mut buf)?;
        Ok(u16::from_ne_bytes(buf))
    }

    pub fn read_i32(&mut self) -> Result<i32, RingError> {
        let mut buf = [0u8; 4];
        self.consume(&mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32, RingError> {
        let mut buf = [0u8; 4];
        self.consume(&mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    pub fn read_i64(&mut self) -> Result<i64, RingError> {
        let mut buf = [0u8; 8];
        self.consume(&mut buf)?;
        Ok(i64::from_ne_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64, RingError> {
        let mut buf = [0u8; 8];
        self.consume(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn read_f32(&mut self) -> Result<f32, RingError> {
        let mut buf = [0u8; 4];
        self.consume(&mut buf)?;
        Ok(f32::from_ne_bytes(buf))
    }

    pub fn read_f64(&mut self) -> Result<f64, RingError> {
        let mut buf = [0u8; 8];
        self.consume(&mut buf)?;
        Ok(f64::from_ne_bytes(buf))
    }

    pub fn read_custom_data(&mut self) -> Result<Vec<u8>, RingError> {
        let len = self.read_u32()?;
        if len > self.capacity() {
            return Err(RingError::Oversized(len));
        }
        let mut out = vec![0u8; len as usize];
        self.consume(&mut out)?;
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String, RingError> {
        let bytes = self.read_custom_data()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Drops everything committed but not yet read. Reader side only.
    pub fn flush_read(&mut self) {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        header.tail.store(head, Ordering::Release);
    }
}

/// A ring with process-local backing storage, for the in-process half of
/// tests and for channels that never cross a process boundary.
pub struct RingMemory {
    ring: Ring,
    _storage: Box<[u64]>,
}

impl RingMemory {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        let words = (Ring::required_bytes(capacity) + 7) / 8;
        let mut storage = vec![0u64; words].into_boxed_slice();
        let ring = unsafe { Ring::attach(storage.as_mut_ptr() as *mut u8, capacity, true) };
        Self {
            ring,
            _storage: storage,
        }
    }

    pub fn ring(&mut self) -> &mut Ring {
        &mut self.ring
    }

    /// A second view over the same storage, for the opposite side of the
    /// channel when both live in one process.
    ///
    /// # Safety
    /// The caller keeps the SPSC discipline: one side writes, one side reads,
    /// and the [`RingMemory`] outlives the returned view.
    pub unsafe fn peer(&mut self) -> Ring {
        Ring {
            header: self.ring.header,
            data: self.ring.data,
            mask: self.ring.mask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_roundtrip() {
        let mut mem = RingMemory::with_capacity(256);
        let ring = mem.ring();
        assert!(ring.write_opcode(7));
        assert!(ring.write_i32(-42));
        assert!(ring.write_f32(0.25));
        assert!(ring.write_bool(true));
        assert!(ring.write_str("latch"));
        assert!(ring.commit_write());

        assert!(ring.is_data_available_for_reading());
        assert_eq!(ring.read_opcode().unwrap(), 7);
        assert_eq!(ring.read_i32().unwrap(), -42);
        assert_eq!(ring.read_f32().unwrap(), 0.25);
        assert!(ring.read_bool().unwrap());
        assert_eq!(ring.read_string().unwrap(), "latch");
        assert!(!ring.is_data_available_for_reading());
    }

    #[test]
    fn uncommitted_frames_are_invisible() {
        let mut mem = RingMemory::with_capacity(64);
        let ring = mem.ring();
        assert!(ring.write_u32(1));
        assert!(!ring.is_data_available_for_reading());
        assert_eq!(ring.read_u32(), Err(RingError::NotEnoughData));
        assert!(ring.commit_write());
        assert_eq!(ring.read_u32().unwrap(), 1);
    }

    #[test]
    fn overflow_drops_the_whole_frame() {
        let mut mem = RingMemory::with_capacity(32);
        let ring = mem.ring();
        assert!(ring.write_u32(1));
        assert!(!ring.write_bytes(&[0u8; 64]));
        // The staged u32 must go down with the frame.
        assert!(!ring.write_u32(2));
        assert!(!ring.commit_write());
        assert!(!ring.is_data_available_for_reading());

        // The ring keeps working afterwards.
        assert!(ring.write_u32(3));
        assert!(ring.commit_write());
        assert_eq!(ring.read_u32().unwrap(), 3);
    }

    #[test]
    fn wraparound_preserves_content() {
        let mut mem = RingMemory::with_capacity(32);
        let ring = mem.ring();
        for round in 0u32..100 {
            assert!(ring.write_u32(round));
            assert!(ring.write_u32(round ^ 0xffff_ffff));
            assert!(ring.commit_write());
            assert_eq!(ring.read_u32().unwrap(), round);
            assert_eq!(ring.read_u32().unwrap(), round ^ 0xffff_ffff);
        }
    }

    #[test]
    fn concurrent_producer_consumer() {
        let mut mem = RingMemory::with_capacity(1024);
        let mut reader = unsafe { mem.peer() };
        let writer = mem.ring();

        std::thread::scope(|scope| {
            scope.spawn(move || {
                let mut expected = 0u32;
                while expected < 10_000 {
                    if reader.is_data_available_for_reading() {
                        let value = reader.read_u32().unwrap();
                        assert_eq!(value, expected);
                        expected += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            });

            let mut next = 0u32;
            while next < 10_000 {
                if writer.write_u32(next) && writer.commit_write() {
                    next += 1;
                } else {
                    // Frame dropped on overflow, try again once drained.
                    std::hint::spin_loop();
                }
            }
        });
    }
}
