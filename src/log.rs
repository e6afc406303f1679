//! The implementation of the `SFRA_LOG_REGALLOC` environment variable.
//!
//! `SFRA_LOG_REGALLOC=-` logs every allocation decision to stderr; `SFRA_LOG_REGALLOC=<path>`
//! logs to `<path>` instead. The variable is read once per process.

use std::{env, fs::File, io::Write, sync::LazyLock};

static LOG_REGALLOC: LazyLock<Option<String>> = LazyLock::new(|| match env::var("SFRA_LOG_REGALLOC")
{
    Ok(p) => {
        if p != "-" {
            // If there's an existing log file, truncate (i.e. empty it), so that later appends to
            // the log aren't appending to a previous log run.
            File::create(&p).ok();
        }
        Some(p)
    }
    Err(_) => None,
});

pub(crate) fn should_log_ra() -> bool {
    LOG_REGALLOC.is_some()
}

pub(crate) fn log_ra(s: &str) {
    match LOG_REGALLOC.as_deref() {
        Some("-") => eprintln!("{s}"),
        Some(p) => {
            if let Ok(mut f) = File::options().append(true).open(p) {
                writeln!(f, "{s}").ok();
            }
        }
        None => (),
    }
}
