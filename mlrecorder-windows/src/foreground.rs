//! Resolve the process that owns the foreground window.

use std::path::Path;

use windows::core::PWSTR;
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::System::Threading::{
    OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

use mlrecorder_core::models::audio_models::ProcessTarget;

/// The process owning the focused window, named after its executable.
///
/// `None` when no window has focus (lock screen, desktop switch) or the
/// owner cannot be queried.
pub fn focused_process() -> Option<ProcessTarget> {
    let hwnd = unsafe { GetForegroundWindow() };
    if hwnd.0.is_null() {
        return None;
    }

    let mut pid = 0u32;
    unsafe { GetWindowThreadProcessId(hwnd, Some(&mut pid)) };
    if pid == 0 {
        return None;
    }

    let name = image_name(pid).unwrap_or_else(|| format!("pid-{}", pid));
    Some(ProcessTarget::new(pid, name))
}

fn image_name(pid: u32) -> Option<String> {
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) }.ok()?;

    let mut buffer = [0u16; 1024];
    let mut len = buffer.len() as u32;
    let queried = unsafe { QueryFullProcessImageNameW(handle, PROCESS_NAME_WIN32, PWSTR(buffer.as_mut_ptr()), &mut len) };
    let _ = unsafe { CloseHandle(handle) };

    if let Err(e) = queried {
        log::debug!("QueryFullProcessImageNameW({}) failed: {}", pid, e);
        return None;
    }
    let path = String::from_utf16_lossy(&buffer[..len as usize]);
    Path::new(&path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
