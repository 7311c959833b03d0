use crate::error::{NativeError, Result};
use libc::{c_void, mmap, mprotect, munmap, sysconf, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE, _SC_PAGESIZE};
use std::ptr;

pub fn page_size() -> usize {
    match unsafe { sysconf(_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

/// Makes the pages covering `[data, data + size)` writable until dropped.
///
/// Dropping restores `r-x` and flushes the instruction cache for the range.
pub struct ProtectedMemory {
    address: *mut u8,
    width: usize,
}

impl ProtectedMemory {
    pub unsafe fn new(data: *mut u8, size: usize) -> Result<Self> {
        if data.is_null() || size == 0 {
            return Err(NativeError::NullPointer);
        }

        let page_size = page_size();
        let base = (data as usize / page_size) * page_size;
        let width = ((data as usize + size - 1) / page_size + 1) * page_size - base;
        let address = base as *mut u8;

        if mprotect(address as *mut c_void, width, PROT_READ | PROT_WRITE | PROT_EXEC) == -1 {
            let err = std::io::Error::last_os_error();
            return Err(NativeError::MemoryProtection(format!(
                "{:#x}+{:#x}: {}",
                base, width, err
            )));
        }

        Ok(Self { address, width })
    }
}

impl Drop for ProtectedMemory {
    fn drop(&mut self) {
        unsafe {
            mprotect(self.address as *mut c_void, self.width, PROT_READ | PROT_EXEC);
            flush_instruction_cache(self.address, self.width);
        }
    }
}

pub unsafe fn flush_instruction_cache(start: *mut u8, len: usize) {
    #[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
    {
        extern "C" {
            fn __clear_cache(begin: *mut c_void, end: *mut c_void);
        }
        __clear_cache(start as *mut c_void, start.add(len) as *mut c_void);
    }

    #[cfg(not(any(target_arch = "arm", target_arch = "aarch64")))]
    {
        let _ = (start, len);
    }
}

/// An anonymous mapping that becomes a trampoline once [sealed](Self::seal).
///
/// Unsealed pages are unmapped on drop, so a failed install leaves nothing behind.
pub struct TrampolinePage {
    address: *mut u8,
    size: usize,
}

impl TrampolinePage {
    pub fn allocate() -> Result<Self> {
        let size = page_size();
        let address = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            )
        };

        if address == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(NativeError::MemoryMap(format!("{}", err)));
        }

        Ok(Self {
            address: address as *mut u8,
            size,
        })
    }

    pub fn address(&self) -> usize {
        self.address as usize
    }

    pub fn write_words(&mut self, words: &[u32]) -> Result<()> {
        let len = std::mem::size_of_val(words);
        if len > self.size {
            return Err(NativeError::TrampolineOverflow(self.address()));
        }

        unsafe {
            ptr::copy_nonoverlapping(words.as_ptr() as *const u8, self.address, len);
        }
        Ok(())
    }

    /// Flips the page to `r-x` and leaks it for the rest of the process.
    pub fn seal(self) -> Result<usize> {
        unsafe {
            if mprotect(self.address as *mut c_void, self.size, PROT_READ | PROT_EXEC) == -1 {
                let err = std::io::Error::last_os_error();
                return Err(NativeError::MemoryProtection(format!("{}", err)));
            }
            flush_instruction_cache(self.address, self.size);
        }

        let address = self.address();
        std::mem::forget(self);
        Ok(address)
    }
}

impl Drop for TrampolinePage {
    fn drop(&mut self) {
        unsafe {
            munmap(self.address as *mut c_void, self.size);
        }
    }
}
