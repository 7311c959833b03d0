use crate::error::{NativeError, Result};
use crate::symbol::memmap::LoadedModule;
use std::fmt;

/// A byte pattern where `None` matches any byte.
///
/// Written as space separated hex pairs, `?` or `??` for a wildcard:
/// `"FD 7B ?? A9"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    bytes: Vec<Option<u8>>,
}

impl Signature {
    pub fn parse(pattern: &str) -> Result<Self> {
        let bytes = pattern
            .split_whitespace()
            .map(|token| match token {
                "?" | "??" => Ok(None),
                _ if token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit()) => {
                    u8::from_str_radix(token, 16)
                        .map(Some)
                        .map_err(|_| NativeError::InvalidSignature(format!("bad byte `{}`", token)))
                }
                _ => Err(NativeError::InvalidSignature(format!("bad token `{}`", token))),
            })
            .collect::<Result<Vec<_>>>()?;

        if bytes.is_empty() {
            return Err(NativeError::InvalidSignature("empty pattern".to_string()));
        }
        if bytes.iter().all(Option::is_none) {
            return Err(NativeError::InvalidSignature(
                "pattern has no concrete bytes".to_string(),
            ));
        }

        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches_at(&self, haystack: &[u8]) -> bool {
        self.bytes
            .iter()
            .zip(haystack)
            .all(|(expected, actual)| expected.map_or(true, |b| b == *actual))
    }

    /// Offset of the first match in `haystack`.
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        if self.is_empty() || haystack.len() < self.len() {
            return None;
        }

        haystack
            .windows(self.len())
            .position(|window| self.matches_at(window))
    }

    /// Scans `[base, base + size)` and returns the absolute address of the first match.
    ///
    /// # Safety
    /// The whole range must be mapped and readable for the duration of the call.
    pub unsafe fn scan(&self, base: usize, size: usize) -> Option<usize> {
        if base == 0 || size == 0 {
            return None;
        }

        let region = std::slice::from_raw_parts(base as *const u8, size);
        self.find_in(region).map(|offset| base + offset)
    }

    /// Scans the readable spans of `module` in address order.
    ///
    /// # Safety
    /// `module` must describe mappings that are still live in this process.
    pub unsafe fn scan_module(&self, module: &LoadedModule) -> Result<usize> {
        module
            .readable_spans()
            .into_iter()
            .find_map(|(start, end)| self.scan(start, end - start))
            .ok_or_else(|| NativeError::SignatureNotFound(module.name.clone()))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            match byte {
                Some(b) => write!(f, "{:02X}", b)?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}
