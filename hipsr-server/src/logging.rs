use tracing_subscriber::{
    fmt::{self, format, time},
    prelude::*,
    EnvFilter,
};

/// Initialise tracing with an uptime timer and env-filter control. `RUST_LOG`
/// wins when set; otherwise the workspace crates log at `info` (or `debug`
/// with `-v`) and everything else at `warn`.
pub fn init(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var(
            "RUST_LOG",
            format!(
                "hipsr_server={level},hipsr_archive={level},hipsr_boards={level},\
                 hipsr_config={level},warn"
            ),
        );
    }

    let evt_fmt = format().with_timer(time::Uptime::default()).compact();
    let fmt_layer = fmt::layer().event_format(evt_fmt);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .init();
}
