use std::fmt::Write;

pub const LOG_TAG: &str = "NativeLib";

#[cfg(feature = "debug")]
const MAX_LEVEL: log::LevelFilter = log::LevelFilter::Trace;
#[cfg(not(feature = "debug"))]
const MAX_LEVEL: log::LevelFilter = log::LevelFilter::Debug;

/// Installs the logcat backend. Safe to call more than once.
pub fn init_logging() {
    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(MAX_LEVEL)
                .with_tag(LOG_TAG),
        );
    }

    #[cfg(not(target_os = "android"))]
    {
        log::set_max_level(MAX_LEVEL);
    }
}

const HEX_WIDTH: usize = 16;

/// Formats `data` as offset / hex / ascii rows, sixteen bytes per row.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();

    for (row, chunk) in data.chunks(HEX_WIDTH).enumerate() {
        let _ = write!(out, "0x{:04x}:", row * HEX_WIDTH);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
        for _ in chunk.len()..HEX_WIDTH {
            out.push_str("   ");
        }
        out.push_str("  ");
        out.extend(chunk.iter().map(|&c| {
            if (0x20..0x7f).contains(&c) {
                c as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }

    out
}

#[cfg(feature = "debug")]
pub fn log_hex(data: &[u8], mark: &str) {
    if log::log_enabled!(log::Level::Trace) {
        log::trace!("[{}] {} bytes\n{}", mark, data.len(), hex_dump(data));
    }
}

#[cfg(not(feature = "debug"))]
pub fn log_hex(_data: &[u8], _mark: &str) {}
