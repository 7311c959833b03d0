pub mod arch;
pub mod bridge;
pub mod config;
pub mod context;
pub mod debug;
pub mod error;
pub mod hook;
pub mod intercept;
pub mod symbol;

pub use config::{HookTargets, NativeConfig};
pub use context::{context, HookStatus, NativeContext};
pub use error::{NativeError, Result};
pub use hook::installer::{HookRecord, HookRegistry, OriginalFn};
pub use intercept::unary::{RequestDecision, UnaryCallHandler};

