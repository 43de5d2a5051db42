//! Logging setup for arbalest-solver binaries, examples and tests
//!
//! Diagnostics inside the solver go through `tracing`; this module only
//! installs a subscriber with a compact format. Library users embedding the
//! solver in a larger application should install their own subscriber
//! instead and filter on the `arbalest_solver` target.

use tracing::Level;

/// Initialize the tracing subscriber with the solver's standard configuration.
///
/// Default log level: INFO, overrideable via the `RUST_LOG` environment
/// variable (e.g. `RUST_LOG=arbalest_solver=debug` enables the per-iteration
/// statistics table).
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level.
pub fn init_logger_with_level(default_level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(SolverFormatter)
        .init();
}

/// Compact `[LEVEL HH:MM:SS.mmm target] message` event format.
struct SolverFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for SolverFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        let level = match *metadata.level() {
            Level::ERROR => "\x1b[31mERROR\x1b[0m",
            Level::WARN => "\x1b[33mWARN\x1b[0m",
            Level::INFO => "\x1b[32mINFO\x1b[0m",
            Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
            Level::TRACE => "\x1b[35mTRACE\x1b[0m",
        };

        write!(
            writer,
            "[{} {} {}] ",
            level,
            chrono::Local::now().format("%H:%M:%S%.3f"),
            metadata.target()
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
