use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    fmt::{
        self,
        format::{Format, Full},
        time::SystemTime,
    },
    prelude::*,
};

const LOG_FILE_NAME: &str = "plaid-sync.log";

fn build_base_log_format() -> Format<Full, SystemTime> {
    return fmt::format()
        .with_level(true)
        .with_ansi(false)
        .with_file(true)
        .with_target(true)
        .with_thread_names(true);
}

/// Request bodies carry the Plaid secret and access tokens, so HTTP client and
/// connection internals never log below INFO.
fn log_filter() -> Targets {
    Targets::new()
        .with_target("sqlx", Level::INFO)
        .with_target("hyper", Level::INFO)
        .with_target("hyper_util", Level::INFO)
        .with_target("h2", Level::INFO)
        .with_target("reqwest", Level::INFO)
        .with_target("rustls", Level::INFO)
        .with_default(Level::DEBUG)
}

pub fn setup_logging(base_log_dir: &str) {
    let stdout_layer =
        tracing_subscriber::fmt::layer().event_format(build_base_log_format().with_ansi(true));

    let subscriber = tracing_subscriber::registry()
        .with(log_filter())
        .with(stdout_layer);

    if !base_log_dir.is_empty() {
        let log_file_layer = tracing_subscriber::fmt::layer()
            .event_format(build_base_log_format())
            .with_writer(tracing_appender::rolling::daily(
                base_log_dir,
                LOG_FILE_NAME,
            ));
        let json_file_layer = tracing_subscriber::fmt::layer()
            .event_format(build_base_log_format().json())
            .with_writer(tracing_appender::rolling::daily(
                format!("{}/structured", base_log_dir),
                LOG_FILE_NAME,
            ));
        subscriber.with(log_file_layer).with(json_file_layer).init();
    } else {
        subscriber.init();
    }
}
