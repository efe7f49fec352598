//! Process-wide logging setup. Called once from the binary's `main`; every
//! other crate logs through the installed global logger via the `log`
//! facade macros (`slog-stdlog` bridges the two).

use std::io;

use slog::{slog_o, Drain};
use slog_mozlog_json::MozLogJson;

/// Installs a global `slog` logger. `json=true` is the production mode
/// (MozLog-style JSON on stdout, for log-shipping agents); `json=false`
/// gives a human-readable terminal format for local development.
pub fn init_logging(json: bool) -> Result<(), String> {
    let logger = if json {
        let hostname = hostname::get()
            .map_err(|e| e.to_string())?
            .into_string()
            .map_err(|_| "non-utf8 hostname".to_owned())?;

        let drain = MozLogJson::new(io::stdout())
            .logger_name(format!(
                "{}-{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .msg_type(format!("{}:log", env!("CARGO_PKG_NAME")))
            .hostname(hostname)
            .build()
            .fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog_o!())
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog_o!())
    };
    // Cancel slog_scope's reset-on-drop: `reset_logging` below does it
    // explicitly at shutdown, and the auto-reset can panic mid-test-run.
    slog_scope::set_global_logger(logger).cancel_reset();
    slog_stdlog::init().map_err(|e| e.to_string())?;
    Ok(())
}

pub fn reset_logging() {
    let logger = slog::Logger::root(slog::Discard, slog_o!());
    slog_scope::set_global_logger(logger).cancel_reset();
}
