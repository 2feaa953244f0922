//! tracing configuration
use anyhow::Result;
use clap::ValueEnum;
use tracing_subscriber::{
    Layer, Registry,
    filter::EnvFilter,
    fmt::{
        self,
        format::{Format, PrettyFields},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// How log lines are rendered
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// single-line unstructured text
    #[default]
    Standard,
    /// one json object per line
    Json,
    /// multi-line, human oriented
    Pretty,
}

/// Directives from `--registry-log`, or "info" when they do not parse. HTTP
/// client internals are kept quiet since every watch is a long-poll.
pub fn env_filter(directives: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::try_new(directives)
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("hyper=off".parse()?)
        .add_directive("reqwest=warn".parse()?))
}

/// Install the global subscriber.
pub fn init(directives: &str, format: LogFormat) -> Result<()> {
    let output: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => fmt::layer().json().boxed(),
        LogFormat::Pretty => fmt::layer()
            .event_format(Format::default().pretty().with_source_location(false))
            .fmt_fields(PrettyFields::new())
            .boxed(),
        LogFormat::Standard => fmt::layer().boxed(),
    };
    tracing_subscriber::registry()
        .with(output)
        .with(env_filter(directives)?)
        .try_init()?;
    Ok(())
}
