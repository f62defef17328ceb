//! # KindPath Progress
//!
//! Durable gamification state for the KindPath learning app: stars per
//! subject, badges, and the level and rank derived from them. Built on LMDB
//! (Lightning Memory-Mapped Database) with a C ABI so Flutter or any other UI
//! host can share one store across all of its pages and games.
//!
//! ## Features
//!
//! - **Per-subject star tallies** with a derived total, level and rank
//! - **Idempotent badges**: each badge id unlocks once, timestamped
//! - **Legacy migration**: a pre-subject scalar total becomes math stars, once
//! - **Corruption tolerant**: malformed stored records fall back to defaults
//! - **Synchronous persistence**: every mutation is written before it returns
//! - **Shared environments**: writes merge with what other stores committed
//! - **Safe error handling**: No `unwrap()` calls in production code
//!
//! ## Quick Start
//!
//! ```no_run
//! use kindpath_progress::{create_store, add_stars, get_rank_info};
//! use std::ffi::CString;
//!
//! let name = CString::new("kindpath").unwrap();
//! let store = create_store(name.as_ptr());
//!
//! let subject = CString::new("science").unwrap();
//! let result = add_stars(store, 40, subject.as_ptr());
//! let rank = get_rank_info(store);
//! ```
//!
//! ## FFI Functions
//!
//! Every function except the constructors returns a JSON-encoded
//! [`AppResponse`](app_response::AppResponse), e.g. `{"Ok":"..."}` or
//! `{"ValidationError":"..."}`. Release returned strings with [`free_c_string`].
//!
//! - [`create_store`] / [`create_store_with_config`] - Open a store
//! - [`add_stars`] - Award stars to a subject
//! - [`unlock_badge`] - Unlock a badge once
//! - [`get_rank_info`] - Current rank
//! - [`get_progress`] - Full snapshot (tally, total, level, rank, badges)
//! - [`flush_progress`] - Retry writes that previously failed
//! - [`close_store`] - Flush, close LMDB and free the store

pub mod app_response;
pub mod config;
pub mod local_storage;
pub mod progress_model;
pub mod progress_state;
pub mod rank;

use crate::app_response::AppResponse;
use crate::config::StoreConfig;
use crate::local_storage::LmdbStorage;
use crate::progress_state::ProgressionStore;

use log::{info, warn};
use serde::Serialize;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

/// The store type handed across the FFI boundary.
pub type LmdbProgressStore = ProgressionStore<LmdbStorage>;

/// Opens (or creates) the store `<name>.lmdb` in the working directory.
///
/// # Returns
///
/// A pointer to the store, or null if the name is null, not UTF-8, or the
/// environment cannot be opened. Release it with [`close_store`].
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use kindpath_progress::create_store;
///
/// let name = CString::new("kindpath").unwrap();
/// let store = create_store(name.as_ptr());
/// assert!(!store.is_null());
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_store(name: *const c_char) -> *mut LmdbProgressStore {
    if name.is_null() {
        warn!("Null name pointer passed to create_store");
        return std::ptr::null_mut();
    }

    let name_str = match unsafe { CStr::from_ptr(name).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in name parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    open_store(StoreConfig::new(name_str))
}

/// Opens a store from a JSON [`StoreConfig`].
///
/// ```json
/// { "name": "kindpath", "directory": "/data/user/0/app/files", "key_prefix": "kindpath_" }
/// ```
///
/// Returns null on a null pointer, invalid JSON, an invalid config, or an
/// environment that cannot be opened.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_store_with_config(config_json: *const c_char) -> *mut LmdbProgressStore {
    if config_json.is_null() {
        warn!("Null config pointer passed to create_store_with_config");
        return std::ptr::null_mut();
    }

    let json_str = match unsafe { CStr::from_ptr(config_json).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in config parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    match StoreConfig::from_json(json_str) {
        Ok(config) => open_store(config),
        Err(e) => {
            warn!("Rejected store config: {e}");
            std::ptr::null_mut()
        }
    }
}

fn open_store(config: StoreConfig) -> *mut LmdbProgressStore {
    info!("Opening progress store at: {}", config.lmdb_dir().display());

    match LmdbStorage::open(&config) {
        Ok(storage) => {
            let store = ProgressionStore::load(storage, config.key_prefix.clone());
            info!("✅ Progress store ready ({} stars)", store.total_stars());
            Box::into_raw(Box::new(store))
        }
        Err(e) => {
            warn!("❌ Failed to open progress store: {e}");
            warn!("Attempted path: {}", config.lmdb_dir().display());
            std::ptr::null_mut()
        }
    }
}

/// Awards stars to a subject.
///
/// # Parameters
///
/// * `state` - Store returned by [`create_store`]
/// * `amount` - Stars to add; negative values are rejected with `ValidationError`
/// * `subject` - Subject id (`"math"`, `"science"`, ...); null means `"math"`
///
/// # Returns
///
/// `Ok` carrying the updated progress snapshot as JSON. A `DatabaseError`
/// means the stars were counted for this session but not yet written; they
/// are retried on the next mutation or [`flush_progress`].
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use kindpath_progress::{create_store, add_stars};
///
/// let name = CString::new("kindpath").unwrap();
/// let store = create_store(name.as_ptr());
///
/// let subject = CString::new("english").unwrap();
/// let result = add_stars(store, 50, subject.as_ptr());
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn add_stars(
    state: *mut LmdbProgressStore,
    amount: i64,
    subject: *const c_char,
) -> *const c_char {
    let state = match unsafe { state.as_ref() } {
        Some(s) => s,
        None => {
            let error = AppResponse::BadRequest("Null state pointer passed to add_stars".to_string());
            return response_to_c_string(&error);
        }
    };

    let amount = match u64::try_from(amount) {
        Ok(a) => a,
        Err(_) => {
            let error = AppResponse::ValidationError(format!(
                "Star amount must be non-negative, got {amount}"
            ));
            return response_to_c_string(&error);
        }
    };

    let subject = if subject.is_null() {
        None
    } else {
        match c_ptr_to_string(subject, "subject") {
            Ok(s) => Some(s),
            Err(error_ptr) => return error_ptr,
        }
    };

    match state.add_stars(amount, subject.as_deref()) {
        Ok(()) => ok_json(&state.snapshot()),
        Err(e) => response_to_c_string(&e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnlockResult {
    unlocked: bool,
    persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    write_error: Option<String>,
    snapshot: progress_model::ProgressSnapshot,
}

/// Unlocks a badge if it is not already owned.
///
/// # Returns
///
/// `Ok` carrying `{"unlocked":true|false,"persisted":true|false,"snapshot":{...}}`.
/// `unlocked` is false when the badge was already owned. When the write
/// fails the badge is still unlocked: `persisted` is false, `writeError`
/// carries the storage error, and the next mutation or [`flush_progress`]
/// retries the write.
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use kindpath_progress::{create_store, unlock_badge};
///
/// let name = CString::new("kindpath").unwrap();
/// let store = create_store(name.as_ptr());
///
/// let id = CString::new("space_ace").unwrap();
/// let label = CString::new("Space Ace").unwrap();
/// let icon = CString::new("🚀").unwrap();
/// let result = unlock_badge(store, id.as_ptr(), label.as_ptr(), icon.as_ptr());
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn unlock_badge(
    state: *mut LmdbProgressStore,
    badge_id: *const c_char,
    badge_name: *const c_char,
    badge_icon: *const c_char,
) -> *const c_char {
    let state = match unsafe { state.as_ref() } {
        Some(s) => s,
        None => {
            let error = AppResponse::BadRequest("Null state pointer passed to unlock_badge".to_string());
            return response_to_c_string(&error);
        }
    };

    let id = match c_ptr_to_string(badge_id, "badge id") {
        Ok(s) => s,
        Err(error_ptr) => return error_ptr,
    };
    let name = match c_ptr_to_string(badge_name, "badge name") {
        Ok(s) => s,
        Err(error_ptr) => return error_ptr,
    };
    let icon = match c_ptr_to_string(badge_icon, "badge icon") {
        Ok(s) => s,
        Err(error_ptr) => return error_ptr,
    };

    match state.unlock_badge_outcome(&id, &name, &icon) {
        Ok(outcome) => ok_json(&UnlockResult {
            unlocked: outcome.unlocked,
            persisted: outcome.write_error.is_none(),
            write_error: outcome.write_error.map(|e| e.to_string()),
            snapshot: state.snapshot(),
        }),
        Err(e) => response_to_c_string(&e),
    }
}

/// Returns the current rank as JSON:
/// `{"tier":"Bronze","level":3,"name":"Bronze 3","progress":0.0,"starsToNext":500}`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_rank_info(state: *mut LmdbProgressStore) -> *const c_char {
    match unsafe { state.as_ref() } {
        Some(s) => ok_json(&s.rank_info()),
        None => {
            let error = AppResponse::BadRequest("Null state pointer passed to get_rank_info".to_string());
            response_to_c_string(&error)
        }
    }
}

/// Returns the full progress snapshot as JSON (subject tally, total, level,
/// rank, badges and revision).
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_progress(state: *mut LmdbProgressStore) -> *const c_char {
    match unsafe { state.as_ref() } {
        Some(s) => ok_json(&s.snapshot()),
        None => {
            let error = AppResponse::BadRequest("Null state pointer passed to get_progress".to_string());
            response_to_c_string(&error)
        }
    }
}

/// Retries persisting any progress whose earlier write failed.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn flush_progress(state: *mut LmdbProgressStore) -> *const c_char {
    let state = match unsafe { state.as_ref() } {
        Some(s) => s,
        None => {
            let error = AppResponse::BadRequest("Null state pointer passed to flush_progress".to_string());
            return response_to_c_string(&error);
        }
    };

    match state.flush() {
        Ok(()) => response_to_c_string(&AppResponse::success("Progress flushed")),
        Err(e) => response_to_c_string(&e),
    }
}

/// Flushes pending writes, closes the LMDB environment and frees the store.
///
/// The pointer must not be used after this call, even when the response is
/// an error.
///
/// # Notes
///
/// Call this before a Flutter hot restart so the next [`create_store`] opens
/// a clean environment.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_store(state: *mut LmdbProgressStore) -> *const c_char {
    if state.is_null() {
        let error = AppResponse::BadRequest("Null state pointer passed to close_store".to_string());
        return response_to_c_string(&error);
    }

    let mut store = unsafe { Box::from_raw(state) };

    if let Err(e) = store.flush() {
        warn!("Pending progress lost on close: {e}");
        if let Err(close_err) = store.storage_mut().close_database() {
            warn!("Failed to close LMDB environment: {close_err}");
        }
        return response_to_c_string(&e);
    }

    match store.storage_mut().close_database() {
        Ok(()) => response_to_c_string(&AppResponse::success("Progress store closed successfully")),
        Err(e) => response_to_c_string(&e),
    }
}

/// Releases a string returned by any function of this library.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_c_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(ptr));
    }
}

fn ok_json<T: Serialize>(value: &T) -> *const c_char {
    match serde_json::to_string(value) {
        Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Converts an [`AppResponse`] to a C string owned by the caller.
///
/// Returns null if serialization or C string creation fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Converts a C string pointer to a Rust String.
///
/// # Returns
///
/// * `Ok(String)` - If conversion was successful
/// * `Err(*const c_char)` - A `BadRequest` response for a null pointer or invalid UTF-8
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}
