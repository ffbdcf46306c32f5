//! # CloudSync Extension
//!
//! Bridge between a host environment and the CloudSync engine.
//!
//! This crate provides:
//! - [`HostValue`] marshaling with typed conversions
//! - A [`FunctionRegistry`] of named, arity-checked functions
//! - The [`ExtensionHost`] that runs sync cycles on a worker runtime and
//!   hands out [`SyncHandle`]s
//! - A stable C ABI with host-supplied HTTP
//! - Packaged artifact lookup per platform
//!
//! ## Functions
//!
//! | name | arguments | result |
//! |------|-----------|--------|
//! | `cloudsync_trigger_sync` | | handle |
//! | `cloudsync_get_status` | handle | status text |
//! | `cloudsync_cancel_sync` | handle | 1 if the cancel takes effect |
//! | `cloudsync_version` | | library version |
//! | `cloudsync_siteid` | | replica id (16-byte blob) |
//! | `cloudsync_set_token` | token | null |
//! | `cloudsync_reset_fault` | | null |
//! | `cloudsync_put` | key, value | new version |
//! | `cloudsync_delete` | key | new version, or null if absent |
//! | `cloudsync_get` | key | value, or null |
//! | `cloudsync_pending` | | unpushed change count |

#![warn(missing_docs)]

mod artifact;
mod error;
mod ffi;
mod host;
mod registry;
mod value;

pub use artifact::ArtifactPlatform;
pub use error::{
    clear_last_error, cloudsync_clear_error, cloudsync_last_error, set_last_error, BridgeError,
    BridgeResult, CloudSyncResult,
};
pub use ffi::{
    cloudsync_call, cloudsync_close, cloudsync_http_post_fn, cloudsync_open, cloudsync_value_free,
    CloudSyncHandle, CloudSyncHttpResponse, CloudSyncValue, CloudSyncValueType, FfiHttpClient,
};
pub use host::{ExtensionHost, SyncHandle, VERSION};
pub use registry::FunctionRegistry;
pub use value::{arg, FromHostValue, HostValue};
