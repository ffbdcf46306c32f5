//! Stable C ABI.
//!
//! Memory conventions:
//! - Argument values are borrowed for the duration of the call.
//! - Result values are owned by Rust; release them with
//!   [`cloudsync_value_free`].
//! - Handles come from [`cloudsync_open`] and are released with
//!   [`cloudsync_close`].
//!
//! Network I/O is done by the host through a [`cloudsync_http_post_fn`]
//! callback, so the library never opens sockets itself.

use crate::error::{clear_last_error, fail, set_last_error, BridgeError, BridgeResult, CloudSyncResult};
use crate::host::ExtensionHost;
use crate::value::HostValue;
use cloudsync_engine::{HttpClient, HttpResponse, HttpTransport, Replica, SyncConfig, SyncEngine};
use cloudsync_protocol::ReplicaId;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Type tag of a [`CloudSyncValue`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudSyncValueType {
    /// NULL.
    Null = 0,
    /// `integer` holds the value.
    Integer = 1,
    /// `real` holds the value.
    Real = 2,
    /// `data`/`len` hold UTF-8 text.
    Text = 3,
    /// `data`/`len` hold bytes.
    Blob = 4,
}

impl CloudSyncValueType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Null),
            1 => Some(Self::Integer),
            2 => Some(Self::Real),
            3 => Some(Self::Text),
            4 => Some(Self::Blob),
            _ => None,
        }
    }
}

/// A tagged value crossing the C boundary.
///
/// `kind` carries a [`CloudSyncValueType`] discriminant. Owned text and
/// blob data is followed by a NUL byte not counted in `len`.
#[repr(C)]
#[derive(Debug)]
pub struct CloudSyncValue {
    /// [`CloudSyncValueType`] discriminant.
    pub kind: u32,
    /// Integer payload.
    pub integer: i64,
    /// Real payload.
    pub real: f64,
    /// Text or blob payload.
    pub data: *mut u8,
    /// Payload length in bytes.
    pub len: usize,
}

impl CloudSyncValue {
    /// A NULL value.
    pub fn null() -> Self {
        Self {
            kind: CloudSyncValueType::Null as u32,
            integer: 0,
            real: 0.0,
            data: std::ptr::null_mut(),
            len: 0,
        }
    }

    /// Moves a host value across the boundary, allocating its payload.
    pub fn from_host(value: HostValue) -> Self {
        let mut out = Self::null();
        match value {
            HostValue::Null => {}
            HostValue::Integer(i) => {
                out.kind = CloudSyncValueType::Integer as u32;
                out.integer = i;
            }
            HostValue::Real(r) => {
                out.kind = CloudSyncValueType::Real as u32;
                out.real = r;
            }
            HostValue::Text(s) => {
                out.kind = CloudSyncValueType::Text as u32;
                (out.data, out.len) = alloc_payload(s.into_bytes());
            }
            HostValue::Blob(b) => {
                out.kind = CloudSyncValueType::Blob as u32;
                (out.data, out.len) = alloc_payload(b);
            }
        }
        out
    }

    /// Copies a borrowed value into a host value.
    ///
    /// # Safety
    ///
    /// For text and blob values, `data` must point to `len` readable bytes
    /// (or be null with `len == 0`).
    pub unsafe fn to_host(&self) -> BridgeResult<HostValue> {
        let kind = CloudSyncValueType::from_raw(self.kind)
            .ok_or_else(|| BridgeError::InvalidArgument(format!("unknown value type {}", self.kind)))?;
        Ok(match kind {
            CloudSyncValueType::Null => HostValue::Null,
            CloudSyncValueType::Integer => HostValue::Integer(self.integer),
            CloudSyncValueType::Real => HostValue::Real(self.real),
            CloudSyncValueType::Text => {
                let bytes = borrowed_bytes(self.data, self.len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| BridgeError::InvalidArgument("invalid UTF-8 in text value".into()))?;
                HostValue::Text(text.to_string())
            }
            CloudSyncValueType::Blob => HostValue::Blob(borrowed_bytes(self.data, self.len)?.to_vec()),
        })
    }
}

fn alloc_payload(mut bytes: Vec<u8>) -> (*mut u8, usize) {
    let len = bytes.len();
    bytes.push(0);
    let boxed = bytes.into_boxed_slice();
    (Box::into_raw(boxed).cast::<u8>(), len)
}

unsafe fn borrowed_bytes<'a>(data: *const u8, len: usize) -> BridgeResult<&'a [u8]> {
    if data.is_null() {
        return if len == 0 {
            Ok(&[])
        } else {
            Err(BridgeError::InvalidArgument("null data with non-zero length".into()))
        };
    }
    Ok(std::slice::from_raw_parts(data, len))
}

/// Releases the payload of a value returned by the library.
///
/// The value is reset to NULL, so freeing twice is harmless.
///
/// # Safety
///
/// `value` must be null or point to a value written by this library.
#[no_mangle]
pub unsafe extern "C" fn cloudsync_value_free(value: *mut CloudSyncValue) {
    if value.is_null() {
        return;
    }
    let value = &mut *value;
    if !value.data.is_null() {
        let slice = std::ptr::slice_from_raw_parts_mut(value.data, value.len + 1);
        drop(Box::from_raw(slice));
    }
    *value = CloudSyncValue::null();
}

/// HTTP response filled in by the host callback.
#[repr(C)]
#[derive(Debug)]
pub struct CloudSyncHttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body; must stay valid until the callback is invoked again
    /// with the same context.
    pub body: *const u8,
    /// Body length in bytes.
    pub body_len: usize,
}

/// Host-provided HTTP POST.
///
/// Returns 0 if a response was received (any status), non-zero if the
/// request could not be made at all or took longer than `timeout_ms`. May
/// be called from the sync worker thread.
#[allow(non_camel_case_types)]
pub type cloudsync_http_post_fn = unsafe extern "C" fn(
    context: *mut c_void,
    url: *const c_char,
    body: *const u8,
    body_len: usize,
    timeout_ms: u64,
    response: *mut CloudSyncHttpResponse,
) -> i32;

/// [`HttpClient`] backed by the host callback.
pub struct FfiHttpClient {
    post: cloudsync_http_post_fn,
    context: *mut c_void,
}

// Safety: the host guarantees the callback and its context may be used
// from any thread, as documented on `cloudsync_open`.
unsafe impl Send for FfiHttpClient {}
unsafe impl Sync for FfiHttpClient {}

impl FfiHttpClient {
    /// Wraps a host callback.
    pub fn new(post: cloudsync_http_post_fn, context: *mut c_void) -> Self {
        Self { post, context }
    }
}

impl HttpClient for FfiHttpClient {
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<HttpResponse, String> {
        let url = CString::new(url).map_err(|_| "URL contains NUL".to_string())?;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let mut response = CloudSyncHttpResponse {
            status: 0,
            body: std::ptr::null(),
            body_len: 0,
        };

        // Safety: pointers are valid for the call; the host owns `context`.
        let rc = unsafe {
            (self.post)(
                self.context,
                url.as_ptr(),
                body.as_ptr(),
                body.len(),
                timeout_ms,
                &mut response,
            )
        };
        if rc != 0 {
            return Err(format!("host HTTP callback failed with code {rc}"));
        }

        // Safety: the host keeps the body valid until the next callback.
        let body = unsafe { borrowed_bytes(response.body, response.body_len) }
            .map_err(|e| e.to_string())?
            .to_vec();
        Ok(HttpResponse::new(response.status, body))
    }
}

/// Library handle. Never dereference or modify directly.
#[repr(C)]
pub struct CloudSyncHandle {
    _private: [u8; 0],
}

type FfiHost = ExtensionHost<HttpTransport<FfiHttpClient>>;

fn open_host(path: Option<&str>, config_json: &str, client: FfiHttpClient) -> BridgeResult<FfiHost> {
    let config = SyncConfig::from_json(config_json)?;
    let replica = match path {
        Some(path) => Replica::open(Path::new(path), config.replica.clone())?,
        None => Replica::in_memory_with(ReplicaId::generate(), &config.replica)?,
    };
    let transport = HttpTransport::new(config.server_url.clone(), config.scope.clone(), client)
        .with_schema_hash(config.schema_hash)
        .with_timeout(config.timeout);
    let engine = SyncEngine::new(config, Arc::new(replica), transport)?;
    ExtensionHost::new(engine)
}

unsafe fn optional_str<'a>(ptr: *const c_char, what: &str) -> BridgeResult<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(Some)
        .map_err(|_| BridgeError::InvalidArgument(format!("invalid UTF-8 in {what}")))
}

/// Opens a replica and its sync host.
///
/// # Arguments
///
/// * `path` - Replica directory (null-terminated UTF-8), or null for an
///   in-memory replica
/// * `config_json` - Sync configuration as a JSON document
/// * `http_post` - Host HTTP callback
/// * `http_context` - Passed to every `http_post` call
/// * `out_handle` - Output pointer for the handle
///
/// # Safety
///
/// - `path` and `config_json` must be valid null-terminated strings or null
/// - `http_post` must be callable from any thread with `http_context`
///   until `cloudsync_close` returns
/// - `out_handle` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn cloudsync_open(
    path: *const c_char,
    config_json: *const c_char,
    http_post: Option<cloudsync_http_post_fn>,
    http_context: *mut c_void,
    out_handle: *mut *mut CloudSyncHandle,
) -> CloudSyncResult {
    clear_last_error();

    let Some(http_post) = http_post else {
        set_last_error("null HTTP callback");
        return CloudSyncResult::NullPointer;
    };
    if config_json.is_null() || out_handle.is_null() {
        set_last_error("null pointer argument");
        return CloudSyncResult::NullPointer;
    }

    let result = optional_str(path, "path").and_then(|path| {
        let json = optional_str(config_json, "config")?.unwrap_or_default();
        open_host(path, json, FfiHttpClient::new(http_post, http_context))
    });

    match result {
        Ok(host) => {
            *out_handle = Box::into_raw(Box::new(host)).cast::<CloudSyncHandle>();
            CloudSyncResult::Ok
        }
        Err(e) => fail(&e),
    }
}

/// Closes a handle, cancelling any running cycle.
///
/// # Safety
///
/// `handle` must be null or come from `cloudsync_open`, and must not be
/// used afterwards.
#[no_mangle]
pub unsafe extern "C" fn cloudsync_close(handle: *mut CloudSyncHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle.cast::<FfiHost>()));
    }
}

/// Calls a registered function.
///
/// On success `out` receives the result, to be released with
/// `cloudsync_value_free`. On failure `out` is NULL and
/// `cloudsync_last_error` describes the error.
///
/// # Safety
///
/// - `handle` must come from `cloudsync_open`
/// - `name` must be a valid null-terminated string
/// - `args` must point to `argc` values (or be null with `argc == 0`)
/// - `out` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn cloudsync_call(
    handle: *const CloudSyncHandle,
    name: *const c_char,
    args: *const CloudSyncValue,
    argc: usize,
    out: *mut CloudSyncValue,
) -> CloudSyncResult {
    clear_last_error();

    if handle.is_null() || name.is_null() || out.is_null() || (args.is_null() && argc > 0) {
        set_last_error("null pointer argument");
        return CloudSyncResult::NullPointer;
    }
    *out = CloudSyncValue::null();

    let host = &*handle.cast::<FfiHost>();
    let raw_args: &[CloudSyncValue] = if argc == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(args, argc)
    };

    let result = catch_unwind(AssertUnwindSafe(|| {
        let name = optional_str(name, "function name")?.unwrap_or_default();
        let args = raw_args
            .iter()
            .map(|value| value.to_host())
            .collect::<BridgeResult<Vec<_>>>()?;
        host.call(name, &args)
    }))
    .unwrap_or_else(|_| Err(BridgeError::Panicked("cloudsync_call".into())));

    match result {
        Ok(value) => {
            *out = CloudSyncValue::from_host(value);
            CloudSyncResult::Ok
        }
        Err(e) => fail(&e),
    }
}
