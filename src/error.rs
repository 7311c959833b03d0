use thiserror::Error;

#[derive(Error, Debug)]
pub enum NativeError {
    #[error("Memory protection failed: {0}")]
    MemoryProtection(String),

    #[error("Memory mapping failed: {0}")]
    MemoryMap(String),

    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Signature not found in {0}")]
    SignatureNotFound(String),

    #[error("Invalid signature pattern: {0}")]
    InvalidSignature(String),

    #[error("Hooking is not supported on {0}")]
    UnsupportedArchitecture(&'static str),

    #[error("Hook installation failed: {0}")]
    HookFailed(String),

    #[error("Target {0:#x} is already hooked")]
    AlreadyHooked(usize),

    #[error("Trampoline for {0:#x} does not fit its allocation")]
    TrampolineOverflow(usize),

    #[error("Null pointer encountered")]
    NullPointer,

    #[error("Allocation of {0} bytes failed")]
    AllocationFailed(usize),

    #[error("Managed callback threw an exception")]
    ManagedException,

    #[error("JNI error: {0}")]
    Jni(#[from] jni::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, NativeError>;
