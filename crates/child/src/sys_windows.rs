//! Windows wait primitives.
//!
//! Child handles (unlike Unix PIDs) stay valid until explicitly closed, so
//! there is no reuse race here; the only job is blocking on the handle
//! without holding the `Child` mutex.

use std::io;
use std::os::windows::io::AsRawHandle;
use std::process::Child;

use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Threading::{WaitForSingleObject, INFINITE};

/// The raw process handle, detached from the `Child` borrow.
///
/// Valid for as long as the `Child` it was taken from, which the owning
/// `SharedChild` keeps alive.
pub(crate) struct RawChildHandle(isize);

unsafe impl Send for RawChildHandle {}
unsafe impl Sync for RawChildHandle {}

impl RawChildHandle {
    pub(crate) fn of(child: &Child) -> RawChildHandle {
        RawChildHandle(child.as_raw_handle() as isize)
    }

    fn as_handle(&self) -> HANDLE {
        HANDLE(self.0 as *mut core::ffi::c_void)
    }
}

pub(crate) fn wait_without_reaping(handle: &RawChildHandle) -> io::Result<()> {
    let event = unsafe { WaitForSingleObject(handle.as_handle(), INFINITE) };
    if event == WAIT_OBJECT_0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn poll_without_reaping(handle: &RawChildHandle) -> io::Result<bool> {
    let event = unsafe { WaitForSingleObject(handle.as_handle(), 0) };
    match event {
        WAIT_OBJECT_0 => Ok(true),
        WAIT_TIMEOUT => Ok(false),
        _ => Err(io::Error::last_os_error()),
    }
}
