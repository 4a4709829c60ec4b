//! Platform hooks used by the supervisor. Windows gets console suppression,
//! a kill-on-close job object and the window-title rewrite; every other
//! platform gets no-ops.

use std::process::{Child, Command};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub const TITLE_REWRITE_ROUNDS: u32 = 60;
pub const TITLE_REWRITE_INTERVAL_MS: u64 = 500;

pub trait Platform: Send + Sync {
    /// Adjusts a command before spawn.
    fn configure(&self, command: &mut Command);

    /// Ties a spawned child's lifetime to ours where the OS allows it.
    fn attach(&self, child: &Child);

    /// Starts a detached loop renaming windows of `pid` whose title contains
    /// `marker`. The loop exits after a bounded number of rounds or once
    /// `stop` is set. Never reports failure.
    fn spawn_title_rewriter(&self, pid: u32, marker: String, title: String, stop: Arc<AtomicBool>);
}

#[derive(Debug, Default)]
pub struct NoopPlatform;

impl Platform for NoopPlatform {
    fn configure(&self, _command: &mut Command) {}

    fn attach(&self, _child: &Child) {}

    fn spawn_title_rewriter(&self, _pid: u32, _marker: String, _title: String, _stop: Arc<AtomicBool>) {}
}

/// The capability set for the running OS.
pub fn detect() -> Box<dyn Platform> {
    #[cfg(target_os = "windows")]
    {
        Box::new(windows::WindowsPlatform::default())
    }
    #[cfg(not(target_os = "windows"))]
    {
        Box::new(NoopPlatform)
    }
}

#[cfg(target_os = "windows")]
mod windows {
    use std::os::windows::io::AsRawHandle;
    use std::os::windows::process::CommandExt;
    use std::process::{Child, Command};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use tracing::{debug, warn};
    use windows_sys::Win32::Foundation::{CloseHandle, BOOL, HWND, LPARAM, TRUE};
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation, SetInformationJobObject,
        JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowTextW, GetWindowThreadProcessId, SetWindowTextW,
    };

    use super::{Platform, TITLE_REWRITE_INTERVAL_MS, TITLE_REWRITE_ROUNDS};

    const CREATE_NO_WINDOW: u32 = 0x08000000;

    #[derive(Debug)]
    struct JobHandle(isize);

    impl Drop for JobHandle {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    fn create_job_object() -> std::io::Result<JobHandle> {
        let handle = unsafe { CreateJobObjectW(std::ptr::null_mut(), std::ptr::null()) };
        if handle == 0 {
            return Err(std::io::Error::last_os_error());
        }
        let job = JobHandle(handle);
        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        let result = unsafe {
            SetInformationJobObject(
                job.0,
                JobObjectExtendedLimitInformation,
                &mut info as *mut _ as *mut _,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if result == 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(job)
    }

    #[derive(Debug, Default)]
    pub struct WindowsPlatform {
        job: Mutex<Option<JobHandle>>,
    }

    impl Platform for WindowsPlatform {
        fn configure(&self, command: &mut Command) {
            command.creation_flags(CREATE_NO_WINDOW);
        }

        fn attach(&self, child: &Child) {
            let Ok(mut guard) = self.job.lock() else {
                return;
            };
            if guard.is_none() {
                match create_job_object() {
                    Ok(job) => *guard = Some(job),
                    Err(e) => warn!("job object unavailable: {e}"),
                }
            }
            if let Some(job) = guard.as_ref() {
                let _ = unsafe { AssignProcessToJobObject(job.0, child.as_raw_handle() as isize) };
            }
        }

        fn spawn_title_rewriter(&self, pid: u32, marker: String, title: String, stop: Arc<AtomicBool>) {
            thread::spawn(move || {
                let wide: Vec<u16> = title.encode_utf16().chain(std::iter::once(0)).collect();
                for _ in 0..TITLE_REWRITE_ROUNDS {
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    for hwnd in windows_of(pid) {
                        if window_text(hwnd).is_some_and(|text| text.contains(&marker)) {
                            unsafe {
                                SetWindowTextW(hwnd, wide.as_ptr());
                            }
                            debug!("retitled window {hwnd} of pid {pid}");
                        }
                    }
                    thread::sleep(Duration::from_millis(TITLE_REWRITE_INTERVAL_MS));
                }
            });
        }
    }

    unsafe extern "system" fn collect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let windows = &mut *(lparam as *mut Vec<HWND>);
        windows.push(hwnd);
        TRUE
    }

    fn windows_of(pid: u32) -> Vec<HWND> {
        let mut all: Vec<HWND> = Vec::new();
        unsafe {
            EnumWindows(Some(collect_window), &mut all as *mut Vec<HWND> as LPARAM);
        }
        all.into_iter()
            .filter(|hwnd| {
                let mut owner = 0u32;
                unsafe {
                    GetWindowThreadProcessId(*hwnd, &mut owner);
                }
                owner == pid
            })
            .collect()
    }

    fn window_text(hwnd: HWND) -> Option<String> {
        let mut buf = [0u16; 512];
        let len = unsafe { GetWindowTextW(hwnd, buf.as_mut_ptr(), buf.len() as i32) };
        (len > 0).then(|| String::from_utf16_lossy(&buf[..len as usize]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_platform_leaves_command_untouched() {
        let platform = NoopPlatform;
        let mut command = Command::new("true");
        platform.configure(&mut command);
        assert_eq!(command.get_program(), "true");
        platform.spawn_title_rewriter(1, "x".into(), "y".into(), Arc::new(AtomicBool::new(false)));
    }
}
