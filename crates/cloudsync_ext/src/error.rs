//! Bridge errors, C result codes and the thread-local last error.

use cloudsync_engine::SyncError;
use std::cell::RefCell;
use std::ffi::CString;
use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced to the host.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// No function is registered under the name.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Wrong number of arguments.
    #[error("{function}: expected {expected} argument(s), got {got}")]
    Arity {
        /// Function called.
        function: String,
        /// Declared arity.
        expected: usize,
        /// Arguments supplied.
        got: usize,
    },

    /// An argument has the wrong type.
    #[error("{function}: argument {index} must be {expected}, got {got}")]
    Type {
        /// Function called.
        function: String,
        /// Zero-based argument position.
        index: usize,
        /// Type the function accepts.
        expected: &'static str,
        /// Type the host passed.
        got: &'static str,
    },

    /// Handle not issued by this host.
    #[error("unknown sync handle {0}")]
    InvalidHandle(i64),

    /// A function handler panicked.
    #[error("{0} panicked")]
    Panicked(String),

    /// The sync worker could not be started.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Invalid argument at the C boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Engine error.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Result code for FFI functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudSyncResult {
    /// Operation succeeded.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Invalid argument.
    InvalidArgument = 2,
    /// Null pointer.
    NullPointer = 3,
    /// No such function.
    UnknownFunction = 4,
    /// Wrong argument count.
    Arity = 5,
    /// Wrong argument type.
    Type = 6,
    /// Unknown sync handle.
    InvalidHandle = 7,
    /// A cycle is already running and triggers are rejected.
    AlreadyRunning = 8,
    /// The remote could not be reached.
    NetworkUnavailable = 9,
    /// The auth token was refused; call `cloudsync_set_token`.
    AuthExpired = 10,
    /// The remote refused the request.
    Rejected = 11,
    /// Local storage failed or is full.
    Storage = 12,
    /// Sync disabled after a fatal fault.
    Disabled = 13,
    /// Replica directory held by another process.
    Locked = 14,
}

impl CloudSyncResult {
    /// Returns true if the result indicates success.
    pub fn is_ok(self) -> bool {
        self == CloudSyncResult::Ok
    }

    /// Returns true if the result indicates an error.
    pub fn is_err(self) -> bool {
        self != CloudSyncResult::Ok
    }
}

impl From<&BridgeError> for CloudSyncResult {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::UnknownFunction(_) => CloudSyncResult::UnknownFunction,
            BridgeError::Arity { .. } => CloudSyncResult::Arity,
            BridgeError::Type { .. } => CloudSyncResult::Type,
            BridgeError::InvalidHandle(_) => CloudSyncResult::InvalidHandle,
            BridgeError::InvalidArgument(_) => CloudSyncResult::InvalidArgument,
            BridgeError::Panicked(_) | BridgeError::Runtime(_) => CloudSyncResult::Error,
            BridgeError::Sync(e) => match e {
                SyncError::SyncAlreadyRunning => CloudSyncResult::AlreadyRunning,
                SyncError::NetworkUnavailable(_) => CloudSyncResult::NetworkUnavailable,
                SyncError::AuthExpired(_) => CloudSyncResult::AuthExpired,
                SyncError::RemoteRejected(_) => CloudSyncResult::Rejected,
                SyncError::StorageFull(_)
                | SyncError::StorageCorruption(_)
                | SyncError::Storage(_)
                | SyncError::CheckpointWrite(_) => CloudSyncResult::Storage,
                SyncError::SyncDisabled(_) => CloudSyncResult::Disabled,
                SyncError::ReplicaLocked => CloudSyncResult::Locked,
                SyncError::Config(_) => CloudSyncResult::InvalidArgument,
                _ => CloudSyncResult::Error,
            },
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Sets the last error message.
pub fn set_last_error(message: impl Into<String>) {
    let msg = message.into();
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Clears the last error.
pub fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Records `err` as the last error and returns its result code.
pub fn fail(err: &BridgeError) -> CloudSyncResult {
    set_last_error(err.to_string());
    CloudSyncResult::from(err)
}

/// Gets the last error message as a C string.
///
/// Returns null if no error is set. The pointer is valid until the next
/// FFI call on this thread.
#[no_mangle]
pub extern "C" fn cloudsync_last_error() -> *const std::ffi::c_char {
    LAST_ERROR.with(|e| match e.borrow().as_ref() {
        Some(cstr) => cstr.as_ptr(),
        None => std::ptr::null(),
    })
}

/// Clears the last error message.
#[no_mangle]
pub extern "C" fn cloudsync_clear_error() {
    clear_last_error();
}
