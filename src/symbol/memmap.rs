use crate::error::{NativeError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};

const SELF_MAPS: &str = "/proc/self/maps";

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub name: Option<String>,
}

/// Splits the next whitespace separated field off the front of `rest`.
fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (field, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(field)
}

impl MemoryMap {
    pub fn parse(line: &str) -> Result<Self> {
        let mut rest = line;

        let range = next_field(&mut rest)
            .ok_or_else(|| NativeError::ParseError(format!("empty maps line: {:?}", line)))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| NativeError::ParseError(format!("invalid range: {}", range)))?;
        let start = usize::from_str_radix(start, 16)
            .map_err(|e| NativeError::ParseError(format!("invalid start address: {}", e)))?;
        let end = usize::from_str_radix(end, 16)
            .map_err(|e| NativeError::ParseError(format!("invalid end address: {}", e)))?;

        let perms = next_field(&mut rest).unwrap_or("----");
        let readable = perms.starts_with('r');

        // offset, dev, inode
        for _ in 0..3 {
            next_field(&mut rest);
        }
        // The pathname may itself contain spaces.
        let name = Some(rest.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        Ok(Self {
            start,
            end,
            readable,
            name,
        })
    }

    fn belongs_to(&self, library_name: &str) -> bool {
        match &self.name {
            Some(path) => path
                .rsplit('/')
                .next()
                .map_or(false, |basename| basename == library_name),
            None => false,
        }
    }
}

/// A shared library mapped into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub name: String,
    pub path: String,
    pub base: usize,
    pub size: usize,
    pub regions: Vec<MemoryMap>,
}

impl LoadedModule {
    /// Locates `library_name` (e.g. `libclient.so`) in the current process.
    pub fn find(library_name: &str) -> Result<Self> {
        let maps = load_memory_maps(SELF_MAPS)?;
        Self::from_maps(library_name, maps)
    }

    pub fn from_maps(
        library_name: &str,
        maps: impl IntoIterator<Item = MemoryMap>,
    ) -> Result<Self> {
        let mut regions: Vec<MemoryMap> = maps
            .into_iter()
            .filter(|map| map.belongs_to(library_name))
            .collect();

        if regions.is_empty() {
            return Err(NativeError::LibraryNotFound(library_name.to_string()));
        }
        regions.sort_by_key(|map| map.start);

        let base = regions[0].start;
        let end = regions.iter().map(|map| map.end).max().unwrap_or(base);
        let path = regions[0].name.clone().unwrap_or_default();

        Ok(Self {
            name: library_name.to_string(),
            path,
            base,
            size: end - base,
            regions,
        })
    }

    /// Readable `(start, end)` ranges in address order, with touching regions
    /// joined so a pattern straddling two mappings is still seen whole.
    pub fn readable_spans(&self) -> Vec<(usize, usize)> {
        let mut spans: Vec<(usize, usize)> = Vec::new();

        for map in self.regions.iter().filter(|map| map.readable) {
            match spans.last_mut() {
                Some((_, end)) if *end == map.start => *end = map.end,
                _ => spans.push((map.start, map.end)),
            }
        }

        spans
    }
}

pub fn load_memory_maps(path: &str) -> Result<Vec<MemoryMap>> {
    let reader = BufReader::new(File::open(path)?);
    let mut maps = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        maps.push(MemoryMap::parse(&line)?);
    }

    Ok(maps)
}
