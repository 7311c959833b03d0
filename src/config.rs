use crate::symbol::signature::Signature;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};

/// Environment variable holding a replacement unary-call signature.
pub const SIGNATURE_OVERRIDE_ENV: &str = "NATIVELIB_UNARY_CALL_SIGNATURE";

// Prologue of the unary call in libclient.so. Changes between client builds.
const DEFAULT_UNARY_CALL_SIGNATURE: &str =
    "FD 7B BA A9 FC 6F 01 A9 FA 67 02 A9 F8 5F 03 A9 F6 57 04 A9 F4 4F 05 A9 FD 03 00 91 FF 43 13 D1";

/// Feature toggles pushed from the managed side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeConfig {
    pub disable_metrics: bool,
    pub disable_bitmoji: bool,
}

/// Process-wide storage for [`NativeConfig`], read on every intercepted call.
#[derive(Debug, Default)]
pub struct RuntimeConfig {
    disable_metrics: AtomicBool,
    disable_bitmoji: AtomicBool,
}

impl RuntimeConfig {
    pub const fn new() -> Self {
        Self {
            disable_metrics: AtomicBool::new(false),
            disable_bitmoji: AtomicBool::new(false),
        }
    }

    pub fn apply(&self, config: NativeConfig) {
        self.disable_metrics
            .store(config.disable_metrics, Ordering::Release);
        self.disable_bitmoji
            .store(config.disable_bitmoji, Ordering::Release);
    }

    pub fn snapshot(&self) -> NativeConfig {
        NativeConfig {
            disable_metrics: self.disable_metrics.load(Ordering::Acquire),
            disable_bitmoji: self.disable_bitmoji.load(Ordering::Acquire),
        }
    }
}

/// Everything `init` needs to find and patch its two targets.
#[derive(Debug, Clone)]
pub struct HookTargets {
    pub native_lib_class: &'static str,
    pub native_config_class: &'static str,
    pub unary_call_method: &'static str,
    pub unary_call_method_sig: &'static str,
    pub libc_library: &'static str,
    pub fstat_symbol: &'static str,
    pub client_library: &'static str,
    pub client_module: &'static str,
    pub unary_call_signature: Signature,
}

impl HookTargets {
    /// Built-in targets, with the unary-call signature taken from
    /// [`SIGNATURE_OVERRIDE_ENV`] when it is set and parses.
    pub fn from_env() -> Self {
        let override_pattern = std::env::var(SIGNATURE_OVERRIDE_ENV).ok();
        Self::with_signature_override(override_pattern.as_deref())
    }

    pub fn with_signature_override(pattern: Option<&str>) -> Self {
        let mut targets = Self::default();

        if let Some(pattern) = pattern {
            match Signature::parse(pattern) {
                Ok(signature) => {
                    info!("using overridden unary call signature ({} bytes)", signature.len());
                    targets.unary_call_signature = signature;
                }
                Err(e) => warn!("ignoring unary call signature override: {}", e),
            }
        }

        targets
    }
}

impl Default for HookTargets {
    fn default() -> Self {
        Self {
            native_lib_class: "me/rhunk/snapenhance/nativelib/NativeLib",
            native_config_class: "me/rhunk/snapenhance/nativelib/NativeConfig",
            unary_call_method: "onNativeUnaryCall",
            unary_call_method_sig:
                "(Ljava/lang/String;[B)Lme/rhunk/snapenhance/nativelib/NativeRequestData;",
            libc_library: "libc.so",
            fstat_symbol: "fstat",
            client_library: "client",
            client_module: "libclient.so",
            unary_call_signature: Signature::parse(DEFAULT_UNARY_CALL_SIGNATURE)
                .unwrap_or_default(),
        }
    }
}
