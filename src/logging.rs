//! Process-wide logger and library init flag. Grounded on DESIGN NOTES
//! §9 ("global mutable state ... model as a lazily-initialized
//! singleton guarded by a once-init primitive") and the `log: path` /
//! `OTAMA_LOG_LEVEL` configuration knobs of spec.md §6.
//!
//! This is a small `log::Log` implementation rather than a pull of
//! `env_logger` into the core library: `env_logger` writes to
//! stdout/stderr only and is meant for binaries (it is pulled in, but
//! only behind the `cli` feature, for `otama-cli`). A library wants a
//! configurable file target without imposing a global logger choice on
//! its embedder, so the core ships its own minimal sink and only
//! installs it once, via `std::sync::Once`, matching the "lazily
//! initialized singleton" note directly.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::{Once, OnceLock};

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

static INIT: Once = Once::new();
static SINK: OnceLock<FileSink> = OnceLock::new();

struct FileSink {
    file: Option<Mutex<std::fs::File>>,
    filter: LevelFilter,
}

/// Maps the otama-specific four-level scale onto `log::LevelFilter`.
/// `notice` has no exact standard-log equivalent; it is treated as
/// `Info`, matching the original library's informational-but-not-noisy
/// intent for that level.
fn parse_otama_level(s: &str) -> LevelFilter {
    match s.to_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "notice" => LevelFilter::Info,
        "error" => LevelFilter::Error,
        "quiet" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

impl Log for FileSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= level_from_filter(self.filter)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} {}:{}:{} {}\n",
            record.level(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.target(),
            record.args()
        );
        match &self.file {
            Some(f) => {
                let mut f = f.lock();
                let _ = f.write_all(line.as_bytes());
            }
            None => {
                eprint!("{}", line);
            }
        }
    }

    fn flush(&self) {
        if let Some(f) = &self.file {
            let _ = f.lock().flush();
        }
    }
}

fn level_from_filter(filter: LevelFilter) -> Level {
    match filter {
        LevelFilter::Off => Level::Error, // enabled() already rejects everything for Off
        LevelFilter::Error => Level::Error,
        LevelFilter::Warn => Level::Warn,
        LevelFilter::Info => Level::Info,
        LevelFilter::Debug => Level::Debug,
        LevelFilter::Trace => Level::Trace,
    }
}

/// Install the process-wide logger exactly once. `log_path` comes from
/// `Config.log`; `OTAMA_LOG_LEVEL` overrides the otherwise-default
/// `notice` level, matching spec.md §6.
pub fn init(log_path: Option<&Path>) {
    INIT.call_once(|| {
        let filter = match std::env::var("OTAMA_LOG_LEVEL") {
            Ok(v) => parse_otama_level(&v),
            Err(_) => LevelFilter::Info,
        };
        let file = log_path.and_then(|p| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .ok()
                .map(Mutex::new)
        });
        let sink = FileSink { file, filter };
        let _ = SINK.set(sink);
        if let Some(sink) = SINK.get() {
            let _ = log::set_logger(sink);
            log::set_max_level(filter);
        }
    });
}

#[cfg(test)]
mod logging_test {
    use super::*;

    #[test]
    fn test_parse_otama_level() {
        assert_eq!(parse_otama_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_otama_level("ERROR"), LevelFilter::Error);
        assert_eq!(parse_otama_level("quiet"), LevelFilter::Off);
        assert_eq!(parse_otama_level("notice"), LevelFilter::Info);
        assert_eq!(parse_otama_level("nonsense"), LevelFilter::Info);
    }

    #[test]
    fn test_init_is_idempotent() {
        init(None);
        init(None);
    }
}
