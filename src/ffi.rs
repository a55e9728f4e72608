//! C ABI for hosts that decode config notifications themselves.
//!
//! [`decode_camera_config`] hands out a heap record owned by the caller, which
//! must pass it back to [`free_camera_config`] exactly once.

use crate::domain::models::ConfigRecord;
use crate::infrastructure::bluetooth::protocol;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr::{self, NonNull};
use tracing::debug;

#[repr(C)]
pub struct CameraConfigC {
    pub id: *mut c_char,
    pub value: *mut c_char,
    /// Null when there are no choices.
    pub choices: *mut *mut c_char,
    pub choices_len: usize,
    pub readonly: bool,
}

fn into_c_record(record: &ConfigRecord) -> Option<*mut CameraConfigC> {
    let strings: Option<Vec<CString>> = std::iter::once(&record.id)
        .chain(std::iter::once(&record.value))
        .chain(record.choices.iter())
        .map(|s| CString::new(s.as_str()).ok())
        .collect();
    // Interior NUL bytes cannot cross the boundary; nothing is allocated yet.
    let mut strings = strings?.into_iter().map(CString::into_raw);

    let id = strings.next()?;
    let value = strings.next()?;
    let choices: Box<[*mut c_char]> = strings.collect();
    let choices_len = choices.len();
    let choices = if choices_len == 0 {
        ptr::null_mut()
    } else {
        Box::into_raw(choices) as *mut *mut c_char
    };

    Some(Box::into_raw(Box::new(CameraConfigC {
        id,
        value,
        choices,
        choices_len,
        readonly: record.is_read_only,
    })))
}

/// Decode one notification payload.
///
/// Returns null if `data` is null, `len` is zero, or the payload does not
/// decode.
///
/// # Safety
/// `data` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn decode_camera_config(data: *const u8, len: usize) -> *mut CameraConfigC {
    if data.is_null() || len == 0 {
        return ptr::null_mut();
    }
    let payload = std::slice::from_raw_parts(data, len);
    match protocol::decode(payload) {
        Ok(record) => into_c_record(&record).unwrap_or(ptr::null_mut()),
        Err(e) => {
            debug!("decode_camera_config failed: {}", e);
            ptr::null_mut()
        }
    }
}

/// Release a record from [`decode_camera_config`]. Null is a no-op.
///
/// # Safety
/// `ptr` must be null or a pointer returned by [`decode_camera_config`] that
/// has not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn free_camera_config(ptr: *mut CameraConfigC) {
    if ptr.is_null() {
        return;
    }
    let config = Box::from_raw(ptr);

    for s in [config.id, config.value] {
        if !s.is_null() {
            drop(CString::from_raw(s));
        }
    }

    if !config.choices.is_null() {
        let choices = Box::from_raw(ptr::slice_from_raw_parts_mut(
            config.choices,
            config.choices_len,
        ));
        for &choice in choices.iter() {
            if !choice.is_null() {
                drop(CString::from_raw(choice));
            }
        }
    }
}

/// Owned view of a record decoded through the C ABI. Freed on drop.
pub struct DecodedConfig {
    ptr: NonNull<CameraConfigC>,
}

impl DecodedConfig {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        // SAFETY: the slice is valid for its length.
        let raw = unsafe { decode_camera_config(payload.as_ptr(), payload.len()) };
        NonNull::new(raw).map(|ptr| Self { ptr })
    }

    pub fn to_record(&self) -> ConfigRecord {
        // SAFETY: `ptr` came from `decode_camera_config` and is freed only in `drop`.
        unsafe {
            let config = self.ptr.as_ref();
            let read = |s: *const c_char| CStr::from_ptr(s).to_string_lossy().into_owned();
            let choices = if config.choices.is_null() {
                Vec::new()
            } else {
                std::slice::from_raw_parts(config.choices, config.choices_len)
                    .iter()
                    .map(|&c| read(c))
                    .collect()
            };
            ConfigRecord {
                id: read(config.id),
                value: read(config.value),
                choices,
                is_read_only: config.readonly,
            }
        }
    }
}

impl Drop for DecodedConfig {
    fn drop(&mut self) {
        // SAFETY: owned exclusively; this is the only release.
        unsafe { free_camera_config(self.ptr.as_ptr()) }
    }
}
