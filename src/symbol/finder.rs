use crate::error::{NativeError, Result};
use std::ffi::CString;

fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|e| NativeError::ParseError(format!("{}: {}", value, e)))
}

/// Resolves an exported symbol of an already loaded library.
///
/// Falls back to the global lookup scope when `library` cannot be opened by name.
pub fn find_symbol(library: &str, symbol: &str) -> Result<usize> {
    let library_c = to_cstring(library)?;
    let symbol_c = to_cstring(symbol)?;

    unsafe {
        let handle = libc::dlopen(library_c.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD);
        if !handle.is_null() {
            let addr = libc::dlsym(handle, symbol_c.as_ptr());
            libc::dlclose(handle);
            if !addr.is_null() {
                return Ok(addr as usize);
            }
        }

        let addr = libc::dlsym(libc::RTLD_DEFAULT, symbol_c.as_ptr());
        if addr.is_null() {
            return Err(NativeError::SymbolNotFound(format!("{}!{}", library, symbol)));
        }
        Ok(addr as usize)
    }
}

/// `dlopen`s a library by absolute path and keeps it loaded for the process lifetime.
pub fn load_library(path: &str) -> Result<()> {
    let path_c = to_cstring(path)?;

    let handle = unsafe { libc::dlopen(path_c.as_ptr(), libc::RTLD_NOW) };
    if handle.is_null() {
        return Err(NativeError::LibraryNotFound(path.to_string()));
    }
    Ok(())
}
