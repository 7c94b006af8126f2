//! C-compatible call surface for keybridge.
//!
//! One process-wide [`Session`] over the evdev platform and the uinput sink,
//! created on first use. Configuration comes from `$KEYBRIDGE_CONFIG` or the
//! default config path. See `include/keybridge.h` for the C declarations.
//!
//! A typical host registers devices, calls `grab`, then loops on `wait_key`
//! and `send_key` (possibly from two threads) until it calls `release`.

#![allow(unsafe_code)]

use std::ffi::{c_char, CStr, CString};
use std::sync::OnceLock;

use keybridge_engine::setup::{linux_session, load_config};
use keybridge_engine::{Config, Session};
use keybridge_hid::linux::{EvdevPlatform, UinputClient};
use keybridge_types::{DeviceFilter, DeviceInfo, IdentityHash, KeyEvent};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

type LinuxSession = Session<EvdevPlatform, UinputClient>;

static SESSION: OnceLock<LinuxSession> = OnceLock::new();

fn session() -> &'static LinuxSession {
    SESSION.get_or_init(|| {
        let (config, config_error) = match load_config(None) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        };
        init_tracing(&config.session.log_level);
        if let Some(e) = config_error {
            warn!(error = %e, "falling back to default config");
        }
        linux_session(&config)
    })
}

/// Install a subscriber unless the host already has one.
fn init_tracing(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .try_init();
}

/// Borrow a nullable C string. `None` for null or invalid UTF-8.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<Result<&'a str, ()>> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_str().map_err(|_| ()))
}

/// One entry of the list returned by [`get_device_list`].
#[repr(C)]
#[derive(Debug)]
pub struct DeviceData {
    pub name: *mut c_char,
    pub vendor_id: u32,
    pub product_id: u32,
}

/// Register every present keyboard named `product` for capture. Null or an
/// empty string registers all keyboards. Returns true iff a device matched.
///
/// # Safety
///
/// `product` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn register_device(product: *const c_char) -> bool {
    match str_arg(product) {
        None => session().register(&DeviceFilter::All),
        Some(Ok(name)) => session().register(&DeviceFilter::from_name(Some(name))),
        Some(Err(())) => {
            warn!("device name is not valid UTF-8");
            false
        }
    }
}

/// Register the present keyboard whose identity hash is `hash`.
#[no_mangle]
pub extern "C" fn register_device_hash(hash: u64) -> bool {
    session().register(&DeviceFilter::Identity(IdentityHash(hash)))
}

/// Start capturing. 0 on success, 1 if nothing is registered, 2 if already
/// grabbed, -1 on any other failure.
#[no_mangle]
pub extern "C" fn grab() -> i32 {
    match session().grab() {
        Ok(()) => 0,
        Err(e) => {
            warn!(error = %e, "grab failed");
            e.status()
        }
    }
}

/// Block until the next captured key event and store it in `out`. Returns
/// false once the session is released or if nothing is grabbed.
///
/// # Safety
///
/// `out` must be null or valid for writing one `KeyEvent`.
#[no_mangle]
pub unsafe extern "C" fn wait_key(out: *mut KeyEvent) -> bool {
    if out.is_null() {
        return false;
    }
    match session().wait_key() {
        Some(event) => {
            out.write(event);
            true
        }
        None => false,
    }
}

/// Apply `event` to the virtual keyboard. 0 on success, 1 for a value other
/// than 0 or 1, 2 for an unknown usage page, 3 when the report is full, -1
/// for a null pointer.
///
/// # Safety
///
/// `event` must be null or point to a valid `KeyEvent`.
#[no_mangle]
pub unsafe extern "C" fn send_key(event: *const KeyEvent) -> i32 {
    let Some(event) = event.as_ref() else {
        return -1;
    };
    match session().send_key(event) {
        Ok(()) => 0,
        Err(e) => {
            debug!(%event, error = %e, "event not applied");
            e.status()
        }
    }
}

/// Release every captured device and the virtual keyboard. Safe to call at
/// any time, any number of times.
#[no_mangle]
pub extern "C" fn release() {
    session().release();
}

/// Print the name of every present keyboard, one per line.
#[no_mangle]
pub extern "C" fn list_keyboards() {
    for info in session().list_devices() {
        println!("{}", info.name);
    }
}

/// Print identity hash, vendor/product id and name of every present keyboard.
#[no_mangle]
pub extern "C" fn list_keyboards_with_ids() {
    for info in session().list_devices() {
        println!("{}", describe(&info));
    }
}

fn describe(info: &DeviceInfo) -> String {
    format!(
        "{}  {:04x}:{:04x}  {}",
        info.identity, info.vendor_id, info.product_id, info.name
    )
}

/// Snapshot of the present keyboards. The count is stored in `out_count`.
/// Free the result with [`free_device_list`]. Returns null for an empty list.
///
/// # Safety
///
/// `out_count` must be null or valid for writing one `usize`.
#[no_mangle]
pub unsafe extern "C" fn get_device_list(out_count: *mut usize) -> *mut DeviceData {
    let (list, count) = into_device_list(session().list_devices());
    if !out_count.is_null() {
        out_count.write(count);
    }
    list
}

fn into_device_list(devices: Vec<DeviceInfo>) -> (*mut DeviceData, usize) {
    if devices.is_empty() {
        return (std::ptr::null_mut(), 0);
    }
    let entries: Box<[DeviceData]> = devices
        .into_iter()
        .map(|info| DeviceData {
            name: CString::new(info.name.replace('\0', ""))
                .unwrap_or_default()
                .into_raw(),
            vendor_id: info.vendor_id,
            product_id: info.product_id,
        })
        .collect();
    let count = entries.len();
    (Box::into_raw(entries).cast::<DeviceData>(), count)
}

/// Free a list returned by [`get_device_list`].
///
/// # Safety
///
/// `list` and `count` must come from one `get_device_list` call, and the list
/// must not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn free_device_list(list: *mut DeviceData, count: usize) {
    if list.is_null() {
        return;
    }
    let entries = Box::from_raw(std::ptr::slice_from_raw_parts_mut(list, count));
    for entry in entries.iter() {
        if !entry.name.is_null() {
            drop(CString::from_raw(entry.name));
        }
    }
}

/// Whether the virtual keyboard service (uinput) is available.
#[no_mangle]
pub extern "C" fn driver_activated() -> bool {
    session().driver_activated()
}

/// Whether a present keyboard is named exactly `product`. Null or empty
/// matches any keyboard.
///
/// # Safety
///
/// `product` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn device_matches(product: *const c_char) -> bool {
    match str_arg(product) {
        None => true,
        Some(Ok(name)) => name.is_empty() || session().device_matches(name),
        Some(Err(())) => false,
    }
}
