pub mod aarch64;

use crate::error::Result;

/// Patches `target` to jump to `interceptor` using the backend for this architecture.
///
/// # Safety
/// `target` must be the entry of a function in mapped executable memory.
pub unsafe fn hook_function(
    target: usize,
    interceptor: usize,
    publish: impl FnOnce(usize),
) -> Result<usize> {
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::hook_function_aarch64(target, interceptor, publish)
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (target, interceptor, publish);
        Err(crate::error::NativeError::UnsupportedArchitecture(std::env::consts::ARCH))
    }
}
