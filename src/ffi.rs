//! C ABI
//!
//! The host process loads this crate as a shared library and drives it
//! through three exported functions. The opaque handle returned by
//! `StartWorker` pins the tokio runtime and the worker's cancellation
//! state for the host's lifetime; the callback receives a pointer into a
//! scratch buffer that is only valid for the duration of the call.

use std::ffi::{c_char, c_void, CStr};
use std::ptr;

use tracing::error;

use crate::config::Config;
use crate::worker::{EventSink, Worker};

/// Host callback: JSON encoding of the event and whether the container was
/// added. The pointer must be copied before returning.
pub type EventCallback = unsafe extern "C" fn(json: *const c_char, added: bool);

struct WorkerHandle {
    runtime: tokio::runtime::Runtime,
    worker: Option<Worker>,
}

/// Wrap the C callback in a sink owning the scratch buffer. Callbacks are
/// serialized by the single multiplexer task, so one buffer suffices.
fn callback_sink(callback: EventCallback) -> EventSink {
    let mut scratch: Vec<u8> = Vec::with_capacity(4096);
    Box::new(move |json, added| {
        scratch.clear();
        scratch.extend_from_slice(json.as_bytes());
        scratch.push(0);
        unsafe { callback(scratch.as_ptr() as *const c_char, added) };
    })
}

/// Parse the init-config, build the adapters, deliver the initial
/// inventory, and leave the worker running. Returns null on configuration
/// or setup failure.
///
/// # Safety
///
/// `init_cfg` must be a valid NUL-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn StartWorker(
    callback: Option<EventCallback>,
    init_cfg: *const c_char,
) -> *mut c_void {
    let Some(callback) = callback else {
        return ptr::null_mut();
    };
    if init_cfg.is_null() {
        return ptr::null_mut();
    }
    let raw_config = match unsafe { CStr::from_ptr(init_cfg) }.to_str() {
        Ok(raw) => raw,
        Err(_) => return ptr::null_mut(),
    };
    let config = match Config::from_json(raw_config) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "init-config rejected");
            return ptr::null_mut();
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "runtime construction failed");
            return ptr::null_mut();
        }
    };

    let worker = match runtime.block_on(Worker::start(config, callback_sink(callback))) {
        Ok(worker) => worker,
        Err(err) => {
            error!(error = %err, "worker startup failed");
            return ptr::null_mut();
        }
    };

    Box::into_raw(Box::new(WorkerHandle {
        runtime,
        worker: Some(worker),
    })) as *mut c_void
}

/// Fire cancellation, wait for every task to drain, and release the
/// handle. The handle must not be used again afterwards.
///
/// # Safety
///
/// `handle` must be a pointer returned by `StartWorker` that has not been
/// passed to `StopWorker` before, or null.
#[no_mangle]
pub unsafe extern "C" fn StopWorker(handle: *mut c_void) {
    if handle.is_null() {
        return;
    }
    let mut handle = unsafe { Box::from_raw(handle as *mut WorkerHandle) };
    if let Some(worker) = handle.worker.take() {
        handle.runtime.block_on(worker.stop());
    }
    // Dropping the handle tears down the runtime after every task is done.
}

/// Queue a container id for on-demand lookup. Never blocks the caller;
/// unrecognized ids produce no callback.
///
/// # Safety
///
/// `handle` must be a live pointer returned by `StartWorker` (or null) and
/// `id` a valid NUL-terminated string (or null).
#[no_mangle]
pub unsafe extern "C" fn AskForContainerInfo(handle: *mut c_void, id: *const c_char) {
    if handle.is_null() || id.is_null() {
        return;
    }
    let handle = unsafe { &*(handle as *const WorkerHandle) };
    let Ok(id) = (unsafe { CStr::from_ptr(id) }).to_str() else {
        return;
    };
    if let Some(worker) = &handle.worker {
        worker.ask(id);
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static WORKER_CALLBACKS: AtomicUsize = AtomicUsize::new(0);
    static SINK_CALLBACKS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn worker_callback(json: *const c_char, _added: bool) {
        // The pointer must be readable for the duration of the call.
        let text = unsafe { CStr::from_ptr(json) };
        assert!(text.to_str().unwrap().starts_with("{\"container\""));
        WORKER_CALLBACKS.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn sink_callback(json: *const c_char, _added: bool) {
        let text = unsafe { CStr::from_ptr(json) };
        assert!(text.to_str().unwrap().starts_with("{\"container\""));
        SINK_CALLBACKS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn null_arguments_are_rejected() {
        unsafe {
            assert!(StartWorker(None, ptr::null()).is_null());
            let cfg = CString::new("{}").unwrap();
            assert!(StartWorker(None, cfg.as_ptr()).is_null());
            assert!(StartWorker(Some(worker_callback), ptr::null()).is_null());
            // Harmless no-ops.
            StopWorker(ptr::null_mut());
            AskForContainerInfo(ptr::null_mut(), ptr::null());
        }
    }

    #[test]
    fn malformed_config_yields_null_handle() {
        let cfg = CString::new("{engines:").unwrap();
        let handle = unsafe { StartWorker(Some(worker_callback), cfg.as_ptr()) };
        assert!(handle.is_null());
    }

    #[test]
    fn empty_config_starts_and_stops_cleanly() {
        let cfg = CString::new(r#"{"engines": {"docker": {"enabled": false, "sockets": []}}}"#)
            .unwrap();
        let handle = unsafe { StartWorker(Some(worker_callback), cfg.as_ptr()) };
        assert!(!handle.is_null());

        let id = CString::new("cafebabe").unwrap();
        unsafe { AskForContainerInfo(handle, id.as_ptr()) };

        unsafe { StopWorker(handle) };
        // No adapters were configured: no callbacks, and the unrecognized
        // lookup id was dropped silently.
        assert_eq!(WORKER_CALLBACKS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_sink_reuses_scratch_buffer() {
        let mut sink = callback_sink(sink_callback);
        sink("{\"container\":{}}", true);
        sink("{\"container\":{}}", false);
        assert_eq!(SINK_CALLBACKS.load(Ordering::SeqCst), 2);
    }
}
