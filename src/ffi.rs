//! C ABI so a non-Rust peer can drive the same protocol.
//!
//! A handle created with [`cblk_create`] acts as the server; one opened with
//! [`cblk_attach`] acts as the client. Fallible calls return a non-negative
//! result or one of the negative `CBLK_ERR_*` codes, and log the failure to
//! the ring drained by [`cblk_pop_log`].

use std::ffi::{CStr, CString, c_char};
use std::ptr;
use std::slice;

use tracing::debug;

use crate::cblk::CblkConfig;
use crate::packed::VolumeLR;
use crate::region::TrackRegion;
use crate::{CblkError, Direction, LOG_CACHE, Side, init_tracing, pop_log, push_log};

/// Success.
pub const CBLK_OK: i64 = 0;
/// Null handle or pointer argument.
pub const CBLK_ERR_NULL: i64 = -1;
/// Block is `INVALID`.
pub const CBLK_ERR_INVALIDATED: i64 = -2;
/// Block is `DISABLED`.
pub const CBLK_ERR_DISABLED: i64 = -3;
/// Counters were found inconsistent.
pub const CBLK_ERR_INCONSISTENT: i64 = -4;
/// Bad arguments, loop or configuration.
pub const CBLK_ERR_ARGUMENT: i64 = -5;
/// Mapping or file failure.
pub const CBLK_ERR_IO: i64 = -6;
/// Nothing to do right now, or a wait ran out.
pub const CBLK_ERR_AGAIN: i64 = -7;

/// Opaque handle owning one mapped region.
pub struct CblkHandle {
    region: TrackRegion,
    direction: Direction,
    side: Side,
}

fn status_code(err: &CblkError) -> i64 {
    match err {
        CblkError::Invalidated => CBLK_ERR_INVALIDATED,
        CblkError::Disabled => CBLK_ERR_DISABLED,
        CblkError::Inconsistent { .. } => CBLK_ERR_INCONSISTENT,
        CblkError::InvalidLoop(_)
        | CblkError::InvalidConfig(_)
        | CblkError::FrameSizeMismatch { .. } => CBLK_ERR_ARGUMENT,
        CblkError::BadRegion(_) | CblkError::Io(_) => CBLK_ERR_IO,
        CblkError::WouldBlock | CblkError::TimedOut => CBLK_ERR_AGAIN,
    }
}

fn translate<T: Into<i64>>(call: &str, result: Result<T, CblkError>) -> i64 {
    match result {
        Ok(value) => value.into(),
        Err(err) => {
            push_log(format!("{call} failed: {err}"));
            status_code(&err)
        }
    }
}

fn direction_from(raw: u8) -> Option<Direction> {
    match raw {
        0 => Some(Direction::Output),
        1 => Some(Direction::Input),
        _ => None,
    }
}

unsafe fn path_from<'a>(path: *const c_char) -> Option<&'a str> {
    if path.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(path) }.to_str().ok()
}

/// Construct a control block with inline buffers and return a server handle.
///
/// `path` names a file other processes can attach to; `NULL` creates an
/// anonymous mapping. `direction` is 0 for playback, 1 for capture. Returns
/// `NULL` on failure.
///
/// # Safety
///
/// `path` must be `NULL` or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_create(
    path: *const c_char,
    frame_count: u32,
    sample_rate: u32,
    frame_size: u8,
    direction: u8,
) -> *mut CblkHandle {
    init_tracing();
    let Some(direction) = direction_from(direction) else {
        push_log(format!("cblk_create: unknown direction {direction}"));
        return ptr::null_mut();
    };
    let config = CblkConfig::new(frame_count, sample_rate, frame_size);
    let region = match unsafe { path_from(path) } {
        Some(path) => TrackRegion::create_file(path, config, direction),
        None if path.is_null() => TrackRegion::create_anonymous(config, direction),
        None => Err(CblkError::InvalidConfig("path is not UTF-8")),
    };
    match region {
        Ok(region) => Box::into_raw(Box::new(CblkHandle {
            region,
            direction,
            side: Side::Server,
        })),
        Err(err) => {
            push_log(format!("cblk_create failed: {err}"));
            ptr::null_mut()
        }
    }
}

/// Attach to a file-backed block and return a client handle, or `NULL`. The
/// direction is taken from the region.
///
/// # Safety
///
/// `path` must be a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_attach(path: *const c_char) -> *mut CblkHandle {
    init_tracing();
    let Some(path) = (unsafe { path_from(path) }) else {
        push_log("cblk_attach: bad path");
        return ptr::null_mut();
    };
    match TrackRegion::open_file(path) {
        Ok(region) => Box::into_raw(Box::new(CblkHandle {
            direction: region.direction(),
            region,
            side: Side::Client,
        })),
        Err(err) => {
            push_log(format!("cblk_attach failed: {err}"));
            ptr::null_mut()
        }
    }
}

/// Unmap and free a handle.
///
/// # Safety
///
/// `handle` must be `NULL` or come from `cblk_create`/`cblk_attach`, and must
/// not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_destroy(handle: *mut CblkHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
    }
}

/// Frames this handle's side may touch right now.
///
/// # Safety
///
/// `handle` must be `NULL` or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_frames_available(handle: *const CblkHandle) -> i64 {
    if handle.is_null() {
        return CBLK_ERR_NULL;
    }
    let handle = unsafe { &*handle };
    translate(
        "cblk_frames_available",
        handle
            .region
            .control_block()
            .frames_available(handle.direction, handle.side),
    )
}

/// Advance this handle's counter by up to `frames`. Returns frames advanced.
///
/// # Safety
///
/// `handle` must be `NULL` or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_step(handle: *const CblkHandle, frames: u32) -> i64 {
    if handle.is_null() {
        return CBLK_ERR_NULL;
    }
    let handle = unsafe { &*handle };
    let cblk = handle.region.control_block();
    let result = match handle.side {
        Side::Client => cblk.step_user(handle.direction, frames),
        Side::Server => cblk.step_server(handle.direction, frames),
    };
    translate("cblk_step", result)
}

/// Copy `frames` frames from `data` into the ring. Only valid on the
/// producing side. Returns frames written.
///
/// # Safety
///
/// `data` must point to `frames * frame_size` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_write(
    handle: *const CblkHandle,
    data: *const u8,
    frames: u32,
) -> i64 {
    if handle.is_null() || data.is_null() {
        return CBLK_ERR_NULL;
    }
    let handle = unsafe { &*handle };
    if handle.side != handle.direction.producer() {
        push_log("cblk_write called on the consuming side");
        return CBLK_ERR_ARGUMENT;
    }
    let frame_size = handle.region.control_block().frame_size();
    let bytes = unsafe { slice::from_raw_parts(data, frames as usize * frame_size) };
    let result = handle.region.inline_track().and_then(|track| {
        let written = track.produce_bytes(handle.direction, bytes)?;
        if handle.side == Side::Server {
            track.control_block().notify_progress();
        }
        Ok(written as i64)
    });
    translate("cblk_write", result)
}

/// Copy up to `frames` frames out of the ring into `data`. Only valid on the
/// consuming side. Returns frames read.
///
/// # Safety
///
/// `data` must point to `frames * frame_size` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_read(handle: *const CblkHandle, data: *mut u8, frames: u32) -> i64 {
    if handle.is_null() || data.is_null() {
        return CBLK_ERR_NULL;
    }
    let handle = unsafe { &*handle };
    if handle.side != handle.direction.consumer() {
        push_log("cblk_read called on the producing side");
        return CBLK_ERR_ARGUMENT;
    }
    let frame_size = handle.region.control_block().frame_size();
    let out = unsafe { slice::from_raw_parts_mut(data, frames as usize * frame_size) };
    let result = handle.region.inline_track().and_then(|track| {
        let read = track.consume_bytes(handle.direction, out)?;
        if handle.side == Side::Server {
            track.control_block().notify_progress();
        }
        Ok(read as i64)
    });
    translate("cblk_read", result)
}

/// Store both channel gains as one word.
///
/// # Safety
///
/// `handle` must be `NULL` or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_set_volume(handle: *const CblkHandle, left: f32, right: f32) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { &*handle };
    handle
        .region
        .control_block()
        .set_volume_lr(VolumeLR::from_gains(left, right));
}

/// Packed volume word: left in the low half, right in the high half.
///
/// # Safety
///
/// `handle` must be `NULL` or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_volume_lr(handle: *const CblkHandle) -> u32 {
    if handle.is_null() {
        return 0;
    }
    unsafe { &*handle }.region.control_block().volume_lr().bits()
}

/// Set the auxiliary send level.
///
/// # Safety
///
/// `handle` must be `NULL` or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_set_send_level(handle: *const CblkHandle, level: f32) {
    if handle.is_null() {
        return;
    }
    unsafe { &*handle }.region.control_block().set_send_level(level);
}

/// Snapshot of the status bits.
///
/// # Safety
///
/// `handle` must be `NULL` or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_flags(handle: *const CblkHandle) -> u32 {
    if handle.is_null() {
        return 0;
    }
    unsafe { &*handle }.region.control_block().flags().bits()
}

/// Configure a playback loop. Client handles only.
///
/// # Safety
///
/// `handle` must be `NULL` or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_set_loop(
    handle: *const CblkHandle,
    start: u32,
    end: u32,
    count: i32,
) -> i64 {
    if handle.is_null() {
        return CBLK_ERR_NULL;
    }
    let handle = unsafe { &*handle };
    if handle.side != Side::Client || handle.direction != Direction::Output {
        push_log("cblk_set_loop requires a playback client handle");
        return CBLK_ERR_ARGUMENT;
    }
    let cblk = handle.region.control_block();
    let guard = cblk.lock();
    let result = cblk.set_loop(&guard, start, end, count).map(|()| CBLK_OK);
    drop(guard);
    translate("cblk_set_loop", result)
}

/// Clear `DISABLED` and any underrun.
///
/// # Safety
///
/// `handle` must be `NULL` or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_restart(handle: *const CblkHandle) -> i64 {
    if handle.is_null() {
        return CBLK_ERR_NULL;
    }
    let cblk = unsafe { &*handle }.region.control_block();
    translate("cblk_restart", cblk.restart().map(|()| CBLK_OK))
}

/// Mark the block `INVALID` and wake every waiter.
///
/// # Safety
///
/// `handle` must be `NULL` or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cblk_invalidate(handle: *const CblkHandle) {
    if handle.is_null() {
        return;
    }
    let cblk = unsafe { &*handle }.region.control_block();
    debug!(name = cblk.name(), "invalidated over ffi");
    cblk.invalidate();
}

/// Pop the next buffered log line, or `NULL` when none remain. The string
/// stays valid until the next call.
#[unsafe(no_mangle)]
pub extern "C" fn cblk_pop_log() -> *const c_char {
    if let Some(message) = pop_log() {
        let mut cache = LOG_CACHE.lock();
        *cache = Some(CString::new(message).unwrap_or_default());
        cache.as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null())
    } else {
        ptr::null()
    }
}
