//! Provided-buffer ring for multishot receive
//!
//! One anonymous private mapping holds the kernel-visible ring entries
//! followed by the buffer data area. Every receive completion names a
//! buffer id in the upper 16 bits of its flags; the buffer is handed to
//! the upstream and must be released exactly once, which re-advertises
//! the slot to the kernel.

use std::io;

use io_uring::cqueue;
use io_uring::types::BufRingEntry;

/// Buffer group id; a single provided-buffer group is used.
pub(crate) const BUFFERS_GROUP_ID: u16 = 0;

pub(crate) struct ProvidedBuffers {
    /// mmap base: `[BufRingEntry; entries]` then `entries * buf_len` data bytes
    base: *mut u8,
    map_len: usize,
    entries: u32,
    buf_len: u32,
    mask: u16,
    local_tail: u16,
}

impl ProvidedBuffers {
    pub(crate) fn new(entries: u32, buf_len: u32) -> io::Result<Self> {
        assert!(entries.is_power_of_two(), "buffer count must be a power of two");
        assert!(entries <= u32::from(u16::MAX));

        let ring_len = entries as usize * std::mem::size_of::<BufRingEntry>();
        let map_len = ring_len + entries as usize * buf_len as usize;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mut buffers = ProvidedBuffers {
            base: base as *mut u8,
            map_len,
            entries,
            buf_len,
            mask: (entries - 1) as u16,
            local_tail: 0,
        };
        // advertise every slot, then publish the tail once
        for id in 0..entries as u16 {
            buffers.push_slot(id);
        }
        buffers.publish_tail();
        Ok(buffers)
    }

    /// Ring base address for `register_buf_ring`.
    pub(crate) fn ring_addr(&self) -> u64 {
        self.base as u64
    }

    pub(crate) fn ring_entries(&self) -> u16 {
        self.entries as u16
    }

    fn data_base(&self) -> *mut u8 {
        let ring_len = self.entries as usize * std::mem::size_of::<BufRingEntry>();
        unsafe { self.base.add(ring_len) }
    }

    fn push_slot(&mut self, id: u16) {
        let idx = (self.local_tail & self.mask) as usize;
        let entry = unsafe { &mut *(self.base as *mut BufRingEntry).add(idx) };
        let addr = unsafe { self.data_base().add(id as usize * self.buf_len as usize) };
        entry.set_addr(addr as u64);
        entry.set_len(self.buf_len);
        entry.set_bid(id);
        self.local_tail = self.local_tail.wrapping_add(1);
    }

    fn publish_tail(&self) {
        let tail =
            unsafe { BufRingEntry::tail(self.base as *const BufRingEntry) as *mut u16 };
        unsafe {
            std::sync::atomic::AtomicU16::from_ptr(tail)
                .store(self.local_tail, std::sync::atomic::Ordering::Release);
        }
    }

    /// Buffer selected by a receive completion.
    ///
    /// A completion with `res > 0` that lacks the buffer flag breaks the
    /// provided-buffer protocol; that is unrecoverable.
    pub(crate) fn get(&self, res: i32, flags: u32) -> (*const u8, usize, u16) {
        let id = match cqueue::buffer_select(flags) {
            Some(id) => id,
            None => panic!("recv completion missing buffer flag"),
        };
        let ptr = unsafe { self.data_base().add(id as usize * self.buf_len as usize) };
        (ptr as *const u8, res as usize, id)
    }

    /// Return a buffer to the kernel.
    pub(crate) fn release(&mut self, id: u16) {
        self.push_slot(id);
        self.publish_tail();
    }
}

impl Drop for ProvidedBuffers {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}
