use crate::config::NativeConfig;
use crate::context::context;
use libc::{c_int, stat};
use log::{debug, warn};
use std::io::ErrorKind;
use std::path::PathBuf;

/// Queue directory of the client's metrics uploader.
pub const METRICS_QUEUE_MARKER: &str = "files/blizzardv2/queues";
/// Cache of the avatar content provider.
pub const BITMOJI_MARKER: &str = "com.snap.file_manager_4_SCContent";

pub type FstatFn = unsafe extern "C" fn(c_int, *mut stat) -> c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVerdict {
    PassThrough,
    /// Delete the file and report it missing.
    Remove,
    /// Report the file missing.
    Hide,
}

pub fn classify(path: &str, config: NativeConfig) -> FileVerdict {
    if config.disable_metrics && path.contains(METRICS_QUEUE_MARKER) {
        FileVerdict::Remove
    } else if config.disable_bitmoji && path.contains(BITMOJI_MARKER) {
        FileVerdict::Hide
    } else {
        FileVerdict::PassThrough
    }
}

pub fn resolve_fd(fd: c_int) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{}", fd)).ok()
}

fn set_errno(code: c_int) {
    unsafe {
        #[cfg(target_os = "android")]
        {
            *libc::__errno() = code;
        }
        #[cfg(not(target_os = "android"))]
        {
            *libc::__errno_location() = code;
        }
    }
}

/// Applies the file policy for `fd`, forwarding to `original` when no rule matches.
pub fn intercept_fstat<F>(config: NativeConfig, fd: c_int, buf: *mut stat, original: F) -> c_int
where
    F: FnOnce(c_int, *mut stat) -> c_int,
{
    if !config.disable_metrics && !config.disable_bitmoji {
        return original(fd, buf);
    }

    let Some(path) = resolve_fd(fd) else {
        return original(fd, buf);
    };

    match classify(&path.to_string_lossy(), config) {
        FileVerdict::PassThrough => original(fd, buf),
        FileVerdict::Remove => {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove {}: {}", path.display(), e),
            }
            set_errno(libc::ENOENT);
            -1
        }
        FileVerdict::Hide => {
            set_errno(libc::ENOENT);
            -1
        }
    }
}

pub unsafe extern "C" fn fstat_hook(fd: c_int, buf: *mut stat) -> c_int {
    let ctx = context();
    let Some(original) = ctx.originals.fstat.get() else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    let original: FstatFn = std::mem::transmute(original);

    intercept_fstat(ctx.config.snapshot(), fd, buf, |fd, buf| original(fd, buf))
}
