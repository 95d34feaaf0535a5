//! Memory-mapped regions holding a control block, and the process-local view
//! that resolves sample addresses.
//!
//! A region is laid out as `[RegionHeader][ControlBlock][samples]`, where the
//! samples are present only for inline buffers. Each process maps the region
//! wherever it likes; nothing stored in it depends on that address.

use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::Path;
use std::ptr::NonNull;

use dasp_frame::Frame;
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};

use crate::cblk::{CblkConfig, ControlBlock, INLINE_BUFFERS};
use crate::{CblkError, Direction, Side};

/// Magic bytes at the start of every region.
pub const REGION_MAGIC: [u8; 4] = *b"CBLK";

/// Bumped whenever the shared layout changes.
pub const LAYOUT_VERSION: u32 = 1;

/// Header preceding the control block so an attaching process can reject a
/// layout it does not understand.
#[repr(C, align(64))]
pub struct RegionHeader {
    magic: [u8; 4],
    layout_version: u32,
    total_len: u64,
    cblk_offset: u32,
    cblk_size: u32,
    buffers_offset: u32,
    buffers_len: u32,
    direction: u32,
}

const _: () = assert!(size_of::<RegionHeader>() == 64);

const CBLK_OFFSET: usize = size_of::<RegionHeader>();
const INLINE_BUFFERS_OFFSET: usize = CBLK_OFFSET + size_of::<ControlBlock>();

/// Where a [`Track`] finds its samples.
pub enum BufferStorage<'a> {
    /// Samples follow the control block in the same region.
    Inline,
    /// Samples live in a separately mapped region owned by the caller.
    External(&'a mut [u8]),
}

/// A mapped region carrying one control block.
pub struct TrackRegion {
    mmap: MmapMut,
    direction: Direction,
    cblk_ptr: *const ControlBlock,
    buffers_ptr: Option<NonNull<u8>>,
    buffers_len: usize,
}

unsafe impl Send for TrackRegion {}
unsafe impl Sync for TrackRegion {}

impl TrackRegion {
    /// Bytes needed for a region built from `config`.
    pub fn required_len(config: &CblkConfig) -> usize {
        if config.buffers == INLINE_BUFFERS {
            INLINE_BUFFERS_OFFSET + config.buffer_bytes()
        } else {
            INLINE_BUFFERS_OFFSET
        }
    }

    /// Construct a block in a fresh anonymous mapping.
    pub fn create_anonymous(config: CblkConfig, direction: Direction) -> Result<Self, CblkError> {
        let mmap = MmapOptions::new()
            .len(Self::required_len(&config))
            .map_anon()?;
        Self::create_in(mmap, config, direction)
    }

    /// Construct a block in a file-backed mapping another process can open.
    pub fn create_file(
        path: impl AsRef<Path>,
        config: CblkConfig,
        direction: Direction,
    ) -> Result<Self, CblkError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(Self::required_len(&config) as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        info!(path = %path.as_ref().display(), "created file-backed control block region");
        Self::create_in(mmap, config, direction)
    }

    /// Construct a block in place at the start of `mmap`.
    ///
    /// Must happen exactly once per region, before the client attaches.
    pub fn create_in(
        mut mmap: MmapMut,
        config: CblkConfig,
        direction: Direction,
    ) -> Result<Self, CblkError> {
        let total_len = Self::required_len(&config);
        if mmap.len() < total_len {
            return Err(CblkError::BadRegion("mapping smaller than required length"));
        }
        let inline = config.buffers == INLINE_BUFFERS;
        let base = mmap.as_mut_ptr();
        let header = RegionHeader {
            magic: REGION_MAGIC,
            layout_version: LAYOUT_VERSION,
            total_len: total_len as u64,
            cblk_offset: CBLK_OFFSET as u32,
            cblk_size: size_of::<ControlBlock>() as u32,
            buffers_offset: if inline { INLINE_BUFFERS_OFFSET as u32 } else { 0 },
            buffers_len: if inline { config.buffer_bytes() as u32 } else { 0 },
            direction: direction as u32,
        };
        unsafe {
            ControlBlock::init_in_place(base.add(CBLK_OFFSET) as *mut ControlBlock, config)?;
            if inline {
                std::ptr::write_bytes(base.add(INLINE_BUFFERS_OFFSET), 0, config.buffer_bytes());
            }
            // Header last: an attacher that sees the magic sees a built block.
            (base as *mut RegionHeader).write(header);
        }
        Self::from_validated(mmap)
    }

    /// Attach to a region another process constructed.
    pub fn attach(mmap: MmapMut) -> Result<Self, CblkError> {
        if mmap.len() < INLINE_BUFFERS_OFFSET {
            return Err(CblkError::BadRegion("mapping smaller than a control block"));
        }
        let header = unsafe { &*(mmap.as_ptr() as *const RegionHeader) };
        if header.magic != REGION_MAGIC {
            return Err(CblkError::BadRegion("missing region magic"));
        }
        if header.layout_version != LAYOUT_VERSION {
            return Err(CblkError::BadRegion("layout version mismatch"));
        }
        if header.cblk_offset as usize != CBLK_OFFSET
            || header.cblk_size as usize != size_of::<ControlBlock>()
        {
            return Err(CblkError::BadRegion("control block layout mismatch"));
        }
        if header.total_len > mmap.len() as u64 {
            return Err(CblkError::BadRegion("mapping shorter than recorded length"));
        }
        let region = Self::from_validated(mmap)?;
        let cblk = region.control_block();
        if cblk.frame_count() == 0 || cblk.frame_size() == 0 {
            return Err(CblkError::BadRegion("control block not constructed"));
        }
        if cblk.has_inline_buffers()
            && region.buffers_len < cblk.frame_count() as usize * cblk.frame_size()
        {
            return Err(CblkError::BadRegion("inline buffers truncated"));
        }
        info!(
            name = cblk.name(),
            frame_count = cblk.frame_count(),
            "attached to control block region"
        );
        Ok(region)
    }

    /// Map and attach to a file-backed region.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, CblkError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        debug!(path = %path.as_ref().display(), "mapped control block region");
        Self::attach(mmap)
    }

    fn from_validated(mut mmap: MmapMut) -> Result<Self, CblkError> {
        let base = mmap.as_mut_ptr();
        let header = unsafe { &*(base as *const RegionHeader) };
        let buffers_ptr = if header.buffers_offset != 0 {
            let end = header.buffers_offset as usize + header.buffers_len as usize;
            if end > mmap.len() {
                return Err(CblkError::BadRegion("inline buffers exceed mapping"));
            }
            NonNull::new(unsafe { base.add(header.buffers_offset as usize) })
        } else {
            None
        };
        let buffers_len = header.buffers_len as usize;
        let direction = match header.direction {
            0 => Direction::Output,
            1 => Direction::Input,
            _ => return Err(CblkError::BadRegion("unknown channel direction")),
        };
        let cblk_ptr = unsafe { base.add(CBLK_OFFSET) as *const ControlBlock };
        Ok(Self {
            mmap,
            direction,
            cblk_ptr,
            buffers_ptr,
            buffers_len,
        })
    }

    /// The shared control block.
    pub fn control_block(&self) -> &ControlBlock {
        unsafe { &*self.cblk_ptr }
    }

    /// Flow direction recorded at construction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Total mapped length.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether the mapping is empty. Never true for a valid region.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Process-local address of the control block, for diagnostics.
    pub fn cblk_address(&self) -> usize {
        self.cblk_ptr as usize
    }

    /// Flush a file-backed mapping to disk.
    pub fn flush(&self) -> Result<(), CblkError> {
        self.mmap.flush()?;
        Ok(())
    }

    /// View over this region's block and the given sample storage.
    pub fn track<'a>(&'a self, storage: BufferStorage<'a>) -> Result<Track<'a>, CblkError> {
        let cblk = self.control_block();
        let (base, len) = match storage {
            BufferStorage::Inline => {
                if !cblk.has_inline_buffers() {
                    return Err(CblkError::BadRegion("block expects external buffers"));
                }
                let base = self
                    .buffers_ptr
                    .ok_or(CblkError::BadRegion("region has no inline buffers"))?;
                (base, self.buffers_len)
            }
            BufferStorage::External(bytes) => {
                let len = bytes.len();
                let base = NonNull::new(bytes.as_mut_ptr())
                    .ok_or(CblkError::BadRegion("null external buffer"))?;
                (base, len)
            }
        };
        Track::new(cblk, base, len)
    }

    /// View using inline storage.
    pub fn inline_track(&self) -> Result<Track<'_>, CblkError> {
        self.track(BufferStorage::Inline)
    }
}

/// Process-local pairing of a control block with this process's address of
/// the sample storage.
#[derive(Clone, Copy)]
pub struct Track<'a> {
    cblk: &'a ControlBlock,
    buffers: NonNull<u8>,
    buffers_len: usize,
    _storage: PhantomData<&'a [u8]>,
}

unsafe impl Send for Track<'_> {}
unsafe impl Sync for Track<'_> {}

impl<'a> Track<'a> {
    fn new(
        cblk: &'a ControlBlock,
        buffers: NonNull<u8>,
        buffers_len: usize,
    ) -> Result<Self, CblkError> {
        let needed = cblk.frame_count() as usize * cblk.frame_size();
        if buffers_len < needed {
            return Err(CblkError::BadRegion("sample storage smaller than ring"));
        }
        Ok(Self {
            cblk,
            buffers,
            buffers_len,
            _storage: PhantomData,
        })
    }

    /// View over a block kept outside any mapping, with caller-owned samples.
    pub fn from_parts(cblk: &'a ControlBlock, buffers: &'a mut [u8]) -> Result<Self, CblkError> {
        let len = buffers.len();
        let base =
            NonNull::new(buffers.as_mut_ptr()).ok_or(CblkError::BadRegion("null buffer"))?;
        Self::new(cblk, base, len)
    }

    /// The shared control block.
    pub fn control_block(&self) -> &'a ControlBlock {
        self.cblk
    }

    /// Bytes of sample storage backing the ring.
    pub fn buffers_len(&self) -> usize {
        self.buffers_len
    }

    /// Address of the slot `counter` projects to under `base`. This is the raw
    /// projection; a loop jump still pending at `loop_end` is not applied.
    pub fn buffer_address(&self, counter: u32, base: u32) -> NonNull<u8> {
        let offset = self.cblk.ring_offset(counter, base) as usize * self.cblk.frame_size();
        unsafe { self.buffers.add(offset) }
    }

    /// Address and length in frames of the next contiguous run `side` may
    /// touch, with any pending loop jump applied.
    pub fn next_run(
        &self,
        direction: Direction,
        side: Side,
    ) -> Result<(NonNull<u8>, u32), CblkError> {
        let (slot, frames) = self.cblk.contiguous_run(direction, side)?;
        let address = unsafe { self.buffers.add(slot as usize * self.cblk.frame_size()) };
        Ok((address, frames))
    }

    /// Address of `slot`.
    fn slot_ptr(&self, slot: u32) -> *mut u8 {
        unsafe {
            self.buffers
                .as_ptr()
                .add(slot as usize * self.cblk.frame_size())
        }
    }

    /// Copy whole frames from `bytes` into the ring on the producing side and
    /// publish them. Returns frames written; fewer than offered when the ring
    /// fills.
    pub fn produce_bytes(&self, direction: Direction, bytes: &[u8]) -> Result<usize, CblkError> {
        let frame_size = self.cblk.frame_size();
        let side = direction.producer();
        let total = bytes.len() / frame_size;
        let mut done = 0usize;
        while done < total {
            let (slot, run) = self.cblk.contiguous_run(direction, side)?;
            let frames = (run as usize).min(total - done);
            if frames == 0 {
                break;
            }
            let src = &bytes[done * frame_size..(done + frames) * frame_size];
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), self.slot_ptr(slot), src.len());
            }
            done += self.cblk.advance(direction, side, frames as u32)? as usize;
        }
        Ok(done)
    }

    /// Copy whole frames out of the ring on the consuming side and release
    /// them. Returns frames read.
    pub fn consume_bytes(&self, direction: Direction, out: &mut [u8]) -> Result<usize, CblkError> {
        let frame_size = self.cblk.frame_size();
        let side = direction.consumer();
        let total = out.len() / frame_size;
        let mut done = 0usize;
        while done < total {
            let (slot, run) = self.cblk.contiguous_run(direction, side)?;
            let frames = (run as usize).min(total - done);
            if frames == 0 {
                break;
            }
            let dst = &mut out[done * frame_size..(done + frames) * frame_size];
            unsafe {
                std::ptr::copy_nonoverlapping(self.slot_ptr(slot), dst.as_mut_ptr(), dst.len());
            }
            done += self.cblk.advance(direction, side, frames as u32)? as usize;
        }
        Ok(done)
    }

    /// Typed variant of [`produce_bytes`](Self::produce_bytes).
    pub fn produce<F: Frame>(
        &self,
        direction: Direction,
        frames: &[F],
    ) -> Result<usize, CblkError> {
        self.check_frame::<F>()?;
        let bytes = unsafe {
            std::slice::from_raw_parts(frames.as_ptr() as *const u8, std::mem::size_of_val(frames))
        };
        self.produce_bytes(direction, bytes)
    }

    /// Typed variant of [`consume_bytes`](Self::consume_bytes).
    pub fn consume<F: Frame>(
        &self,
        direction: Direction,
        out: &mut [F],
    ) -> Result<usize, CblkError> {
        self.check_frame::<F>()?;
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(out.as_mut_ptr() as *mut u8, std::mem::size_of_val(out))
        };
        self.consume_bytes(direction, bytes)
    }

    fn check_frame<F: Frame>(&self) -> Result<(), CblkError> {
        let found = size_of::<F>();
        let expected = self.cblk.frame_size();
        if found != expected {
            return Err(CblkError::FrameSizeMismatch { expected, found });
        }
        Ok(())
    }
}
