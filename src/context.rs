use crate::config::{HookTargets, RuntimeConfig};
use crate::error::Result;
use crate::hook::installer::{HookRecord, HookRegistry, OriginalFn};
use crate::intercept::fstat::fstat_hook;
use crate::intercept::unary::{unary_call_hook, UnaryCallHandler};
use crate::symbol::finder::find_symbol;
use crate::symbol::memmap::LoadedModule;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Trampolines of the two intercepted functions.
#[derive(Debug, Default)]
pub struct Originals {
    pub fstat: OriginalFn,
    pub unary_call: OriginalFn,
}

/// Which hooks `init` managed to wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookStatus {
    pub fstat: bool,
    pub unary_call: bool,
}

/// Process-scoped state shared by the bridge and the interceptors.
pub struct NativeContext {
    pub config: RuntimeConfig,
    pub hooks: HookRegistry,
    pub originals: Originals,
    handler: OnceLock<Box<dyn UnaryCallHandler>>,
    initialized: AtomicBool,
}

static CONTEXT: NativeContext = NativeContext::new();

pub fn context() -> &'static NativeContext {
    &CONTEXT
}

impl NativeContext {
    pub const fn new() -> Self {
        Self {
            config: RuntimeConfig::new(),
            hooks: HookRegistry::new(),
            originals: Originals {
                fstat: OriginalFn::new(),
                unary_call: OriginalFn::new(),
            },
            handler: OnceLock::new(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Returns true for the first caller only.
    pub fn begin_init(&self) -> bool {
        self.initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Sets the unary call handler. Later calls are ignored.
    pub fn set_handler(&self, handler: Box<dyn UnaryCallHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    pub fn handler(&self) -> Option<&dyn UnaryCallHandler> {
        self.handler.get().map(|handler| handler.as_ref())
    }

    pub fn install_fstat_hook(&self, targets: &HookTargets) -> Result<HookRecord> {
        let fstat = find_symbol(targets.libc_library, targets.fstat_symbol)?;
        debug!("{} resolved at {:#x}", targets.fstat_symbol, fstat);

        unsafe { self.hooks.install(fstat, fstat_hook as usize, &self.originals.fstat) }
    }

    pub fn install_unary_call_hook(&self, targets: &HookTargets) -> Result<HookRecord> {
        let module = LoadedModule::find(targets.client_module)?;
        debug!(
            "{} base={:#x}, size={:#x}",
            targets.client_module, module.base, module.size
        );

        let unary_call = unsafe { targets.unary_call_signature.scan_module(&module)? };
        debug!(
            "unary call found at {:#x} (+{:#x})",
            unary_call,
            unary_call - module.base
        );

        unsafe {
            self.hooks
                .install(unary_call, unary_call_hook as usize, &self.originals.unary_call)
        }
    }

    /// Wires both hooks independently; a failure only disables its own feature.
    pub fn install_hooks(&self, targets: &HookTargets) -> HookStatus {
        let fstat = match self.install_fstat_hook(targets) {
            Ok(_) => true,
            Err(e) => {
                error!("fstat hook disabled: {}", e);
                false
            }
        };

        let unary_call = match self.install_unary_call_hook(targets) {
            Ok(_) => true,
            Err(e) => {
                error!("unary call hook disabled: {}", e);
                false
            }
        };

        info!("hooks installed: fstat={}, unary_call={}", fstat, unary_call);
        HookStatus { fstat, unary_call }
    }
}
