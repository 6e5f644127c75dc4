//! Console sink and the `printk` path.
//!
//! The actual character device (VGA text mode) lives outside the core;
//! whoever owns it installs a [`ConsoleSink`] here at boot. The core's
//! job is serialization: concurrent writers go through one reentrant lock
//! so lines from different tasks do not interleave mid-line.
//!
//! `printk!` formats into a fixed 1 KiB stack buffer first and pushes the
//! finished text through the sink in one locked call; oversize output is
//! truncated rather than split.

use core::fmt::{self, Write};

use spin::Once;

use crate::sync::Lock;

/// Size of the `printk!` stack buffer.
pub const PRINTK_BUF_SIZE: usize = 1024;

/// Where console bytes ultimately go. Implemented by the external VGA
/// text writer (or a capture buffer in tests).
pub trait ConsoleSink: Sync {
    fn put_str(&self, s: &str);
}

static SINK: Once<&'static dyn ConsoleSink> = Once::new();
static CONSOLE_LOCK: Once<Lock> = Once::new();

/// Install the output device. First caller wins; later calls are ignored.
pub fn register_sink(sink: &'static dyn ConsoleSink) {
    SINK.call_once(|| sink);
}

/// Set up the console lock. Idempotent.
pub fn init() {
    CONSOLE_LOCK.call_once(Lock::new);
    log::info!("console ready");
}

fn with_lock(f: impl FnOnce()) {
    match CONSOLE_LOCK.get() {
        Some(lock) => {
            lock.acquire();
            f();
            lock.release();
        }
        // Too early for locking (single-threaded boot); write directly.
        None => f(),
    }
}

/// Write `s` to the console under the console lock.
pub fn console_put_str(s: &str) {
    with_lock(|| {
        if let Some(sink) = SINK.get() {
            sink.put_str(s);
        }
    });
}

/// Write one character to the console under the console lock.
pub fn console_put_char(c: char) {
    let mut buf = [0u8; 4];
    console_put_str(c.encode_utf8(&mut buf));
}

/// `fmt::Write` into a caller-provided byte buffer, truncating on
/// overflow instead of failing.
pub struct FixedWriter<'a> {
    buf: &'a mut [u8],
    used: usize,
    truncated: bool,
}

impl<'a> FixedWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            used: 0,
            truncated: false,
        }
    }

    /// The formatted text so far.
    pub fn as_str(&self) -> &str {
        // The writer only ever copies whole `str` fragments or cuts at a
        // char boundary, so the prefix stays valid UTF-8.
        core::str::from_utf8(&self.buf[..self.used]).unwrap_or("")
    }

    /// Whether output was cut to fit.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.used;
        if s.len() <= room {
            self.buf[self.used..self.used + s.len()].copy_from_slice(s.as_bytes());
            self.used += s.len();
        } else {
            // Cut at the last char boundary that fits.
            let mut cut = room;
            while cut > 0 && !s.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buf[self.used..self.used + cut].copy_from_slice(&s.as_bytes()[..cut]);
            self.used += cut;
            self.truncated = true;
        }
        Ok(())
    }
}

/// Backend of the `printk!`/`print!` macros.
#[doc(hidden)]
pub fn _printk(args: fmt::Arguments) {
    let mut buf = [0u8; PRINTK_BUF_SIZE];
    let mut w = FixedWriter::new(&mut buf);
    // FixedWriter never reports errors; it truncates.
    let _ = w.write_fmt(args);
    console_put_str(w.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_writer_formats_in_place() {
        let mut buf = [0u8; 64];
        let mut w = FixedWriter::new(&mut buf);
        write!(w, "pid {} name {} hex {:#x}", 7, "idle", 0xc0100000u32).unwrap();
        assert_eq!(w.as_str(), "pid 7 name idle hex 0xc0100000");
        assert!(!w.is_truncated());
    }

    #[test]
    fn fixed_writer_pads_widths() {
        let mut buf = [0u8; 64];
        let mut w = FixedWriter::new(&mut buf);
        write!(w, "{:<8}|{:>4}", "main", 31).unwrap();
        assert_eq!(w.as_str(), "main    |  31");
    }

    #[test]
    fn fixed_writer_truncates_on_overflow() {
        let mut buf = [0u8; 8];
        let mut w = FixedWriter::new(&mut buf);
        write!(w, "0123456789abcdef").unwrap();
        assert_eq!(w.as_str(), "01234567");
        assert!(w.is_truncated());
    }

    struct Capture;

    static CAPTURED: std::sync::Mutex<std::string::String> =
        std::sync::Mutex::new(std::string::String::new());

    impl ConsoleSink for Capture {
        fn put_str(&self, s: &str) {
            CAPTURED.lock().unwrap().push_str(s);
        }
    }

    /// The console lock blocks on contention, which a hosted test cannot
    /// survive; serialize the tests that take it.
    fn serial() -> std::sync::MutexGuard<'static, ()> {
        static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
        GUARD.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn console_routes_through_sink_under_lock() {
        let _guard = serial();
        init();
        register_sink(&Capture);
        console_put_str("tick 100\n");
        console_put_char('!');
        let captured = CAPTURED.lock().unwrap();
        assert!(captured.contains("tick 100\n"));
        assert!(captured.contains('!'));
    }

    #[test]
    fn printk_formats_and_emits() {
        let _guard = serial();
        init();
        register_sink(&Capture);
        crate::printk!("sector {} ready\n", 1000);
        assert!(CAPTURED.lock().unwrap().contains("sector 1000 ready"));
    }
}
