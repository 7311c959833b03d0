use crate::arch;
use crate::error::{NativeError, Result};
use log::{debug, error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Slot holding the trampoline of a hooked function, zero until installed.
#[derive(Debug, Default)]
pub struct OriginalFn(AtomicUsize);

impl OriginalFn {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    fn publish(&self, addr: usize) {
        self.0.store(addr, Ordering::Release);
    }

    fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRecord {
    pub target: usize,
    pub interceptor: usize,
    pub original: usize,
}

/// Every hook installed in this process. Records are never removed.
#[derive(Debug, Default)]
pub struct HookRegistry {
    records: Mutex<Vec<HookRecord>>,
}

impl HookRegistry {
    pub const fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Redirects `target` to `interceptor`, storing the trampoline in `original`.
    ///
    /// On error nothing has been patched and `original` is left empty.
    ///
    /// # Safety
    /// `target` must be the entry of a function and `interceptor` a function
    /// with the same signature and calling convention.
    pub unsafe fn install(
        &self,
        target: usize,
        interceptor: usize,
        original: &OriginalFn,
    ) -> Result<HookRecord> {
        self.install_with(target, interceptor, original, |target, interceptor, publish| {
            arch::hook_function(target, interceptor, publish)
        })
    }

    fn install_with<F>(
        &self,
        target: usize,
        interceptor: usize,
        original: &OriginalFn,
        patch: F,
    ) -> Result<HookRecord>
    where
        F: FnOnce(usize, usize, &dyn Fn(usize)) -> Result<usize>,
    {
        if target == 0 || interceptor == 0 {
            return Err(NativeError::NullPointer);
        }

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.iter().any(|record| record.target == target) {
            return Err(NativeError::AlreadyHooked(target));
        }

        let publish = |trampoline: usize| original.publish(trampoline);
        let trampoline = match patch(target, interceptor, &publish) {
            Ok(trampoline) => trampoline,
            Err(e) => {
                original.clear();
                error!("failed to hook {:#x}: {}", target, e);
                return Err(e);
            }
        };
        original.publish(trampoline);

        let record = HookRecord {
            target,
            interceptor,
            original: trampoline,
        };
        records.push(record);
        debug!(
            "hooked {:#x} -> {:#x} (original at {:#x})",
            target, interceptor, trampoline
        );

        Ok(record)
    }

    pub fn records(&self) -> Vec<HookRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_publishes_trampoline_before_returning() {
        let registry = HookRegistry::new();
        let original = OriginalFn::new();

        let record = registry
            .install_with(0x1000, 0x2000, &original, |_, _, publish| {
                publish(0x3000);
                Ok(0x3000)
            })
            .unwrap();

        assert_eq!(
            record,
            HookRecord {
                target: 0x1000,
                interceptor: 0x2000,
                original: 0x3000
            }
        );
        assert_eq!(original.get(), Some(0x3000));
        assert_eq!(registry.records(), vec![record]);
    }

    #[test]
    fn second_install_on_same_target_is_refused() {
        let registry = HookRegistry::new();
        let original = OriginalFn::new();
        registry
            .install_with(0x1000, 0x2000, &original, |_, _, _| Ok(0x3000))
            .unwrap();

        let other = OriginalFn::new();
        let result = registry.install_with(0x1000, 0x4000, &other, |_, _, _| {
            panic!("must not patch twice")
        });

        assert!(matches!(result, Err(NativeError::AlreadyHooked(0x1000))));
        assert_eq!(other.get(), None);
        assert_eq!(registry.records().len(), 1);
    }

    #[test]
    fn failed_install_leaves_nothing_wired() {
        let registry = HookRegistry::new();
        let original = OriginalFn::new();

        let result = registry.install_with(0x1000, 0x2000, &original, |_, _, publish| {
            publish(0x3000);
            Err(NativeError::MemoryProtection("denied".to_string()))
        });

        assert!(matches!(result, Err(NativeError::MemoryProtection(_))));
        assert_eq!(original.get(), None);
        assert!(registry.records().is_empty());
    }

    #[test]
    fn null_addresses_are_rejected() {
        let registry = HookRegistry::new();
        let original = OriginalFn::new();
        assert!(matches!(
            unsafe { registry.install(0, 0x2000, &original) },
            Err(NativeError::NullPointer)
        ));
    }

    #[cfg(not(target_arch = "aarch64"))]
    #[test]
    fn other_architectures_are_unsupported() {
        let registry = HookRegistry::new();
        let original = OriginalFn::new();
        let target = other_architectures_are_unsupported as usize;

        let result = unsafe { registry.install(target, target + 16, &original) };
        assert!(matches!(result, Err(NativeError::UnsupportedArchitecture(_))));
        assert_eq!(original.get(), None);
    }

    #[cfg(target_arch = "aarch64")]
    mod inline {
        use super::*;
        use std::hint::black_box;

        static ORIGINAL: OriginalFn = OriginalFn::new();

        #[inline(never)]
        extern "C" fn scale(value: i32, factor: i32) -> i32 {
            black_box(value).wrapping_mul(black_box(factor))
        }

        extern "C" fn scale_plus_one(value: i32, factor: i32) -> i32 {
            let original: extern "C" fn(i32, i32) -> i32 =
                unsafe { std::mem::transmute(ORIGINAL.get().unwrap()) };
            original(value, factor) + 1
        }

        #[test]
        fn hooked_function_runs_interceptor_and_trampoline() {
            let registry = HookRegistry::new();
            let target: extern "C" fn(i32, i32) -> i32 = black_box(scale);

            assert_eq!(target(6, 7), 42);
            unsafe {
                registry
                    .install(scale as usize, scale_plus_one as usize, &ORIGINAL)
                    .unwrap();
            }
            assert_eq!(target(6, 7), 43);
        }
    }
}
