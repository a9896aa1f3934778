use crate::error::ShmError;
use crate::SHM::Structs::ENVELOPE_SIZE;
use crate::SHM::{ContextBuilder, Message, TransportContext};
use crate::Core::ShutdownSignal;
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::ptr;

// Error codes
const DMXP_SUCCESS: i32 = 0;
const DMXP_ERROR_NULL_POINTER: i32 = -1;
const DMXP_ERROR_INVALID_ARG: i32 = -2;
const DMXP_ERROR_ALLOCATION_FAILED: i32 = -3;
const DMXP_ERROR_ABORTED: i32 = -4;
const DMXP_ERROR_INTERNAL: i32 = -5;

lazy_static::lazy_static! {
    static ref CONTEXT: Mutex<Option<TransportContext>> = Mutex::new(None);
}

/// Release function for caller-owned buffers: `(data, hint)`.
#[allow(non_camel_case_types)]
pub type dmxp_free_fn = unsafe extern "C" fn(data: *mut c_void, hint: *mut c_void);

/// Handle to a message instance (opaque pointer)
pub struct MessageHandle {
    inner: Message,
}

/// Caller-owned bytes handed over by `dmxp_msg_new_data`.
struct ForeignBuffer {
    data: *mut u8,
    len: usize,
}

impl AsRef<[u8]> for ForeignBuffer {
    fn as_ref(&self) -> &[u8] {
        if self.data.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

fn error_code(e: &ShmError) -> i32 {
    match e {
        ShmError::Aborted => DMXP_ERROR_ABORTED,
        ShmError::Exhausted { .. } | ShmError::TooLarge { .. } => DMXP_ERROR_ALLOCATION_FAILED,
        ShmError::InvalidEnvelope { .. }
        | ShmError::TargetInitialized
        | ShmError::SourceUninitialized
        | ShmError::NotInitialized => DMXP_ERROR_INVALID_ARG,
        _ => DMXP_ERROR_INTERNAL,
    }
}

fn current_context() -> Option<TransportContext> {
    CONTEXT.lock().clone()
}

fn into_handle(msg: Message) -> *mut MessageHandle {
    Box::into_raw(Box::new(MessageHandle { inner: msg }))
}

fn segment_name<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(name) }.to_str().ok()
}

// -----------------------------------------------------------------------------
// Context API
// -----------------------------------------------------------------------------

/// Create the process context and its arena segment.
///
/// # Arguments
/// * `name` - Segment name under /dev/shm.
/// * `size` - Arena size in bytes.
///
/// # Returns
/// * 0 on success, negative error code otherwise.
#[no_mangle]
pub extern "C" fn dmxp_context_create(name: *const c_char, size: usize) -> i32 {
    let Some(name) = segment_name(name) else {
        return DMXP_ERROR_NULL_POINTER;
    };
    match ContextBuilder::new()
        .with_segment_name(name)
        .with_segment_size(size)
        .create()
    {
        Ok(ctx) => {
            *CONTEXT.lock() = Some(ctx);
            DMXP_SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "FFI: failed to create context");
            error_code(&e)
        }
    }
}

/// Attach the process context to an arena created by another process.
#[no_mangle]
pub extern "C" fn dmxp_context_attach(name: *const c_char) -> i32 {
    let Some(name) = segment_name(name) else {
        return DMXP_ERROR_NULL_POINTER;
    };
    match ContextBuilder::new().with_segment_name(name).attach() {
        Ok(ctx) => {
            *CONTEXT.lock() = Some(ctx);
            DMXP_SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "FFI: failed to attach context");
            error_code(&e)
        }
    }
}

/// Drop the process context. Live messages keep the arena mapped.
#[no_mangle]
pub extern "C" fn dmxp_context_destroy() {
    CONTEXT.lock().take();
}

/// Abort every pending allocation in this process.
#[no_mangle]
pub extern "C" fn dmxp_shutdown() {
    match current_context() {
        Some(ctx) => ctx.shutdown().trigger(),
        None => ShutdownSignal::global().trigger(),
    }
}

// -----------------------------------------------------------------------------
// Message API
// -----------------------------------------------------------------------------

/// Create an empty message (receive target).
///
/// # Returns
/// * Pointer to `MessageHandle`, or NULL if no context exists.
#[no_mangle]
pub extern "C" fn dmxp_msg_new() -> *mut MessageHandle {
    match current_context() {
        Some(ctx) => into_handle(Message::new(&ctx)),
        None => ptr::null_mut(),
    }
}

/// Create a message with a fresh chunk of `size` bytes.
///
/// Blocks while the arena is full. Returns NULL if aborted by shutdown.
#[no_mangle]
pub extern "C" fn dmxp_msg_new_size(size: usize) -> *mut MessageHandle {
    let Some(ctx) = current_context() else {
        return ptr::null_mut();
    };
    match Message::with_size(&ctx, size) {
        Ok(msg) => into_handle(msg),
        Err(e) => {
            tracing::error!(size, error = %e, "FFI: failed to allocate message");
            ptr::null_mut()
        }
    }
}

/// Create a message by copying `data` into shared memory.
///
/// `data` is released afterwards with `ffn(data, hint)`, or `free(data)` if
/// `ffn` is NULL.
#[no_mangle]
pub extern "C" fn dmxp_msg_new_data(
    data: *mut c_void,
    size: usize,
    ffn: Option<dmxp_free_fn>,
    hint: *mut c_void,
) -> *mut MessageHandle {
    let Some(ctx) = current_context() else {
        return ptr::null_mut();
    };
    if data.is_null() && size > 0 {
        return ptr::null_mut();
    }

    let buffer = ForeignBuffer {
        data: data as *mut u8,
        len: size,
    };
    let release = move |buf: ForeignBuffer| unsafe {
        match ffn {
            Some(ffn) => ffn(buf.data as *mut c_void, hint),
            None => libc::free(buf.data as *mut c_void),
        }
    };

    match Message::from_external(&ctx, buffer, release) {
        Ok(msg) => into_handle(msg),
        Err(e) => {
            tracing::error!(size, error = %e, "FFI: failed to adopt buffer");
            ptr::null_mut()
        }
    }
}

/// Rebuild a message from envelope bytes received over the transport.
#[no_mangle]
pub extern "C" fn dmxp_msg_from_envelope(buf: *const u8, len: usize) -> *mut MessageHandle {
    let Some(ctx) = current_context() else {
        return ptr::null_mut();
    };
    if buf.is_null() {
        return ptr::null_mut();
    }
    let bytes = unsafe { std::slice::from_raw_parts(buf, len) };
    match Message::from_envelope(&ctx, bytes) {
        Ok(msg) => into_handle(msg),
        Err(_) => ptr::null_mut(),
    }
}

/// Close the message and reinitialize it: empty if `size` is 0, otherwise
/// with a fresh chunk of `size` bytes.
#[no_mangle]
pub extern "C" fn dmxp_msg_rebuild(handle: *mut MessageHandle, size: usize) -> i32 {
    if handle.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let msg = unsafe { &mut (*handle).inner };
    if size == 0 {
        msg.rebuild();
        return DMXP_SUCCESS;
    }
    match msg.rebuild_with_size(size) {
        Ok(()) => DMXP_SUCCESS,
        Err(e) => error_code(&e),
    }
}

/// Payload address in this process, or NULL for an empty message.
#[no_mangle]
pub extern "C" fn dmxp_msg_data(handle: *mut MessageHandle) -> *mut c_void {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let msg = unsafe { &(*handle).inner };
    match msg.data() {
        Ok(ptr) => ptr.as_ptr() as *mut c_void,
        Err(ShmError::NotInitialized) => ptr::null_mut(),
        Err(e) => {
            tracing::error!(error = %e, "FFI: cannot resolve message data");
            ptr::null_mut()
        }
    }
}

/// Payload size in bytes.
#[no_mangle]
pub extern "C" fn dmxp_msg_size(handle: *const MessageHandle) -> usize {
    if handle.is_null() {
        return 0;
    }
    unsafe { (*handle).inner.size() }
}

/// Write the envelope to send into `out_buf`.
///
/// # Arguments
/// * `out_len` - Input: size of buf, Output: envelope size.
///
/// # Returns
/// * 0 on success.
/// * DMXP_ERROR_INVALID_ARG if the buffer is too small or the message is empty.
#[no_mangle]
pub extern "C" fn dmxp_msg_envelope(
    handle: *const MessageHandle,
    out_buf: *mut u8,
    out_len: *mut usize,
) -> i32 {
    if handle.is_null() || out_buf.is_null() || out_len.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let msg = unsafe { &(*handle).inner };
    let Some(bytes) = msg.envelope_bytes() else {
        return DMXP_ERROR_INVALID_ARG;
    };

    unsafe {
        if *out_len < ENVELOPE_SIZE {
            *out_len = ENVELOPE_SIZE;
            return DMXP_ERROR_INVALID_ARG; // Buffer too small
        }
        ptr::copy_nonoverlapping(bytes.as_ptr(), out_buf, ENVELOPE_SIZE);
        *out_len = ENVELOPE_SIZE;
    }
    DMXP_SUCCESS
}

/// Deep-copy `src` into the empty message `dst`.
#[no_mangle]
pub extern "C" fn dmxp_msg_copy(dst: *mut MessageHandle, src: *const MessageHandle) -> i32 {
    if dst.is_null() || src.is_null() || ptr::eq(dst, src) {
        return DMXP_ERROR_NULL_POINTER;
    }
    let (dst, src) = unsafe { (&mut (*dst).inner, &(*src).inner) };
    match dst.copy_from(src) {
        Ok(()) => DMXP_SUCCESS,
        Err(e) => error_code(&e),
    }
}

/// Hand the chunk to the transport: freeing the message no longer frees it.
#[no_mangle]
pub extern "C" fn dmxp_msg_mark_transferred(handle: *mut MessageHandle) -> i32 {
    if handle.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    unsafe { (*handle).inner.mark_transferred() };
    DMXP_SUCCESS
}

/// Free a message handle.
#[no_mangle]
pub extern "C" fn dmxp_msg_free(handle: *mut MessageHandle) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle); // Dropped automatically
        }
    }
}
