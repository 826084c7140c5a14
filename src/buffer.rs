//! Message buffers and the page-backed size-class allocator.
//!
//! A `MsgBuffer` is a value handle over a page-backed region sized for
//! `max_data_size` bytes of payload plus one packet-header slot per
//! packet. The zeroth packet header carries a magic byte written at
//! allocation time and validated on every use. Handles do not own their
//! memory; `HugeAlloc` does, and buffers are returned to it explicitly.

use std::ptr;

/// Per-packet header size reserved in front of the payload.
pub const PKT_HDR_SIZE: usize = 16;

/// Magic byte stored in the zeroth packet header of every allocated buffer.
pub const MSG_BUFFER_MAGIC: u8 = 0xD6;

/// Page size used for size-class alignment.
pub const PAGE_SIZE: usize = 4096;

const MAGIC_OFF: usize = PKT_HDR_SIZE - 1;

// Datapath frame header offsets (single-packet frames).
const FRAME_DEST_OFF: usize = 0;
const FRAME_SIZE_OFF: usize = 2;
const FRAME_REQ_TYPE_OFF: usize = 6;

/// Number of packets needed to carry `data_size` payload bytes.
#[inline]
pub fn data_size_to_num_pkts(data_size: usize, max_data_per_pkt: usize) -> usize {
    if data_size <= max_data_per_pkt {
        1
    } else {
        (data_size + max_data_per_pkt - 1) / max_data_per_pkt
    }
}

/// Read the destination session number out of a received datapath frame.
#[inline]
pub fn frame_dest_session(frame: &[u8]) -> Option<u16> {
    if frame.len() < PKT_HDR_SIZE {
        return None;
    }
    Some(u16::from_le_bytes([frame[FRAME_DEST_OFF], frame[FRAME_DEST_OFF + 1]]))
}

/// Validate the magic byte of a received datapath frame.
#[inline]
pub fn frame_check_magic(frame: &[u8]) -> bool {
    frame.len() >= PKT_HDR_SIZE && frame[MAGIC_OFF] == MSG_BUFFER_MAGIC
}

// =============================================================================
// HugeAlloc
// =============================================================================

/// Smallest size class.
const MIN_CLASS_SIZE: usize = PAGE_SIZE;

/// Number of power-of-two size classes: 4 KiB .. 8 MiB.
const NUM_CLASSES: usize = 12;

/// A raw buffer leased from the allocator.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer {
    ptr: *mut u8,
    class_size: usize,
}

impl RawBuffer {
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn class_size(&self) -> usize {
        self.class_size
    }
}

/// Size-class pool of page-backed byte buffers.
///
/// Allocations are rounded up to the next power-of-two class and served
/// from per-class freelists; classes grow on demand from page-aligned
/// slabs until the configured capacity cap is hit. Freed buffers return
/// to their class freelist. All backing memory is released when the
/// allocator is dropped.
pub struct HugeAlloc {
    freelists: Vec<Vec<*mut u8>>,
    /// Every slab handed out by the OS, freed on drop.
    slabs: Vec<*mut u8>,
    /// Bytes reserved from the OS.
    reserved: usize,
    /// Capacity cap in bytes.
    capacity: usize,
    /// Bytes currently leased to users.
    user_alloc_tot: usize,
    /// NUMA affinity hint; recorded for diagnostics.
    numa_node: usize,
}

impl HugeAlloc {
    /// Create an allocator with the given capacity cap.
    pub fn new(capacity: usize, numa_node: usize) -> Self {
        Self {
            freelists: (0..NUM_CLASSES).map(|_| Vec::new()).collect(),
            slabs: Vec::new(),
            reserved: 0,
            capacity,
            user_alloc_tot: 0,
            numa_node,
        }
    }

    /// Size of class `idx`.
    #[inline]
    fn class_size(idx: usize) -> usize {
        MIN_CLASS_SIZE << idx
    }

    /// Smallest class that fits `size`, or None if `size` exceeds the
    /// largest class.
    fn class_index(size: usize) -> Option<usize> {
        let mut idx = 0;
        while idx < NUM_CLASSES {
            if Self::class_size(idx) >= size {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    /// Allocate a buffer of at least `size` bytes.
    ///
    /// Returns None when `size` exceeds the largest class or the capacity
    /// cap is reached; both are recoverable out-of-memory conditions.
    pub fn alloc(&mut self, size: usize) -> Option<RawBuffer> {
        debug_assert!(size > 0);
        let idx = Self::class_index(size)?;
        let class_size = Self::class_size(idx);

        let ptr = match self.freelists[idx].pop() {
            Some(ptr) => ptr,
            None => {
                if self.reserved + class_size > self.capacity {
                    return None;
                }
                let mut ptr: *mut libc::c_void = ptr::null_mut();
                let ret = unsafe { libc::posix_memalign(&mut ptr, PAGE_SIZE, class_size) };
                if ret != 0 {
                    return None;
                }
                self.reserved += class_size;
                let ptr = ptr as *mut u8;
                self.slabs.push(ptr);
                ptr
            }
        };

        self.user_alloc_tot += class_size;
        Some(RawBuffer { ptr, class_size })
    }

    /// Return a buffer to its class freelist.
    pub fn free_buf(&mut self, buf: RawBuffer) {
        let idx = Self::class_index(buf.class_size).expect("corrupt buffer class");
        debug_assert_eq!(Self::class_size(idx), buf.class_size);
        self.user_alloc_tot -= buf.class_size;
        self.freelists[idx].push(buf.ptr);
    }

    /// Total bytes currently leased to users.
    #[inline]
    pub fn stat_user_alloc_tot(&self) -> usize {
        self.user_alloc_tot
    }

    /// Total bytes reserved from the OS.
    #[inline]
    pub fn stat_reserved(&self) -> usize {
        self.reserved
    }

    /// The NUMA node hint this allocator was created with.
    #[inline]
    pub fn numa_node(&self) -> usize {
        self.numa_node
    }
}

impl Drop for HugeAlloc {
    fn drop(&mut self) {
        for &ptr in &self.slabs {
            unsafe { libc::free(ptr as *mut libc::c_void) };
        }
    }
}

// Safety: HugeAlloc owns its slabs exclusively; the raw pointers are not
// aliased by the allocator itself.
unsafe impl Send for HugeAlloc {}

// =============================================================================
// MsgBuffer
// =============================================================================

/// A message buffer handle.
///
/// The underlying region holds `max_num_pkts` packet headers plus
/// `max_data_size` payload bytes, with the payload starting after the
/// zeroth header. Handles are cheap value copies; the memory is owned by
/// the allocator, and a handle must not be used after the buffer has been
/// freed.
#[derive(Debug, Clone, Copy)]
pub struct MsgBuffer {
    region: *mut u8,
    class_size: usize,
    max_data_size: usize,
    data_size: usize,
    max_num_pkts: usize,
    num_pkts: usize,
    dynamic: bool,
}

impl MsgBuffer {
    /// Bytes of backing store needed for `max_data_size` payload bytes
    /// split into `max_num_pkts` packets.
    #[inline]
    pub fn required_region_size(max_data_size: usize, max_num_pkts: usize) -> usize {
        max_data_size + max_num_pkts * PKT_HDR_SIZE
    }

    /// Wrap a raw allocator buffer, stamping the magic byte into the
    /// zeroth packet header.
    pub(crate) fn from_raw(raw: RawBuffer, max_data_size: usize, max_num_pkts: usize) -> Self {
        debug_assert!(raw.class_size >= Self::required_region_size(max_data_size, max_num_pkts));
        unsafe {
            ptr::write(raw.ptr.add(MAGIC_OFF), MSG_BUFFER_MAGIC);
        }
        Self {
            region: raw.ptr,
            class_size: raw.class_size,
            max_data_size,
            data_size: max_data_size,
            max_num_pkts,
            num_pkts: max_num_pkts,
            dynamic: true,
        }
    }

    /// True iff this handle refers to an allocated region.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.region.is_null()
    }

    /// Validate the magic byte in the zeroth packet header.
    #[inline]
    pub fn check_magic(&self) -> bool {
        self.is_valid() && unsafe { ptr::read(self.region.add(MAGIC_OFF)) } == MSG_BUFFER_MAGIC
    }

    /// True iff the backing store is allocator-owned.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Current logical payload size.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Maximum payload size of this buffer.
    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Number of packets for the current payload size.
    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    /// Number of packets at maximum payload size.
    #[inline]
    pub fn max_num_pkts(&self) -> usize {
        self.max_num_pkts
    }

    /// The payload as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        debug_assert!(self.is_valid());
        unsafe { std::slice::from_raw_parts(self.region.add(PKT_HDR_SIZE), self.data_size) }
    }

    /// The payload as a mutable byte slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert!(self.is_valid());
        unsafe { std::slice::from_raw_parts_mut(self.region.add(PKT_HDR_SIZE), self.data_size) }
    }

    /// Copy `data` into the payload area and set the logical size.
    /// Packet-count metadata is adjusted by `Rpc::resize_msg_buffer`, not
    /// here.
    ///
    /// # Panics
    /// Panics if `data` exceeds the buffer's maximum payload size.
    pub fn copy_from(&mut self, data: &[u8]) {
        assert!(data.len() <= self.max_data_size);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.region.add(PKT_HDR_SIZE), data.len());
        }
        self.data_size = data.len();
    }

    /// Shrink the logical payload size. Does not touch packet headers.
    pub(crate) fn resize(&mut self, new_data_size: usize, new_num_pkts: usize) {
        debug_assert!(new_data_size <= self.max_data_size);
        debug_assert!(new_num_pkts <= self.max_num_pkts);
        self.data_size = new_data_size;
        self.num_pkts = new_num_pkts;
    }

    /// The raw allocator buffer backing this handle, for freeing.
    pub(crate) fn raw(&self) -> RawBuffer {
        RawBuffer {
            ptr: self.region,
            class_size: self.class_size,
        }
    }

    /// Build a single-packet wire frame: the zeroth packet header is
    /// filled with the destination session number, payload size, and
    /// request type, then header plus payload are copied out.
    pub(crate) fn build_frame(&mut self, dest_session_num: u16, req_type: u8) -> Vec<u8> {
        debug_assert!(self.check_magic());
        unsafe {
            let hdr = std::slice::from_raw_parts_mut(self.region, PKT_HDR_SIZE);
            hdr[FRAME_DEST_OFF..FRAME_DEST_OFF + 2]
                .copy_from_slice(&dest_session_num.to_le_bytes());
            hdr[FRAME_SIZE_OFF..FRAME_SIZE_OFF + 4]
                .copy_from_slice(&(self.data_size as u32).to_le_bytes());
            hdr[FRAME_REQ_TYPE_OFF] = req_type;

            let frame_len = PKT_HDR_SIZE + self.data_size;
            std::slice::from_raw_parts(self.region, frame_len).to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_index() {
        assert_eq!(HugeAlloc::class_index(1), Some(0));
        assert_eq!(HugeAlloc::class_index(PAGE_SIZE), Some(0));
        assert_eq!(HugeAlloc::class_index(PAGE_SIZE + 1), Some(1));
        assert_eq!(HugeAlloc::class_index(8 * 1024 * 1024), Some(11));
        assert_eq!(HugeAlloc::class_index(8 * 1024 * 1024 + 1), None);
    }

    #[test]
    fn test_alloc_free_reuse() {
        let mut alloc = HugeAlloc::new(1024 * 1024, 0);

        let a = alloc.alloc(100).unwrap();
        assert_eq!(a.class_size(), PAGE_SIZE);
        assert_eq!(alloc.stat_user_alloc_tot(), PAGE_SIZE);

        let ptr = a.ptr();
        alloc.free_buf(a);
        assert_eq!(alloc.stat_user_alloc_tot(), 0);

        // Freed buffer is reused before new slabs are reserved.
        let b = alloc.alloc(200).unwrap();
        assert_eq!(b.ptr(), ptr);
        assert_eq!(alloc.stat_reserved(), PAGE_SIZE);
    }

    #[test]
    fn test_alloc_capacity_cap() {
        let mut alloc = HugeAlloc::new(2 * PAGE_SIZE, 0);
        let a = alloc.alloc(PAGE_SIZE).unwrap();
        let _b = alloc.alloc(PAGE_SIZE).unwrap();
        assert!(alloc.alloc(PAGE_SIZE).is_none());

        alloc.free_buf(a);
        assert!(alloc.alloc(PAGE_SIZE).is_some());
    }

    #[test]
    fn test_msg_buffer_magic_and_slices() {
        let mut alloc = HugeAlloc::new(1024 * 1024, 0);
        let raw = alloc
            .alloc(MsgBuffer::required_region_size(1024, 1))
            .unwrap();
        let mut buf = MsgBuffer::from_raw(raw, 1024, 1);

        assert!(buf.is_valid());
        assert!(buf.check_magic());
        assert!(buf.is_dynamic());
        assert_eq!(buf.data_size(), 1024);
        assert_eq!(buf.num_pkts(), 1);

        buf.copy_from(b"hello");
        assert_eq!(buf.data_size(), 5);
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn test_msg_buffer_resize() {
        let mut alloc = HugeAlloc::new(1024 * 1024, 0);
        let raw = alloc
            .alloc(MsgBuffer::required_region_size(4096, 2))
            .unwrap();
        let mut buf = MsgBuffer::from_raw(raw, 4096, 2);

        buf.resize(100, 1);
        assert_eq!(buf.data_size(), 100);
        assert_eq!(buf.num_pkts(), 1);
        assert_eq!(buf.max_data_size(), 4096);
    }

    #[test]
    fn test_build_frame() {
        let mut alloc = HugeAlloc::new(1024 * 1024, 0);
        let raw = alloc
            .alloc(MsgBuffer::required_region_size(1024, 1))
            .unwrap();
        let mut buf = MsgBuffer::from_raw(raw, 1024, 1);
        buf.copy_from(b"payload");

        let frame = buf.build_frame(9, 3);
        assert_eq!(frame.len(), PKT_HDR_SIZE + 7);
        assert_eq!(frame_dest_session(&frame), Some(9));
        assert!(frame_check_magic(&frame));
        assert_eq!(&frame[PKT_HDR_SIZE..], b"payload");
    }

    #[test]
    fn test_data_size_to_num_pkts() {
        assert_eq!(data_size_to_num_pkts(0, 1024), 1);
        assert_eq!(data_size_to_num_pkts(1024, 1024), 1);
        assert_eq!(data_size_to_num_pkts(1025, 1024), 2);
        assert_eq!(data_size_to_num_pkts(2048, 1024), 2);
    }
}
