//! Global `tracing` subscriber setup, adapted from the teacher's `logging`
//! crate. Dropped relative to the teacher: Sentry/telemetry wiring and
//! Windows event log support, which are product-specific surfaces this
//! spec has no use for (noted in DESIGN.md). Kept: the reloadable
//! `EnvFilter` handle, which is genuinely ambient infra (spec.md §10).

mod err_with_sources;

pub use err_with_sources::{ErrorWithSources, err_with_src};

use anyhow::{Context, Result};
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry, filter::LevelFilter, fmt, layer::SubscriberExt as _, reload,
    util::SubscriberInitExt as _,
};

/// Handle returned by [`setup_global_subscriber`] that lets a running
/// process change its log filter directives at runtime, e.g. in response to
/// an internal admin hook (spec.md §10).
#[derive(Clone)]
pub struct FilterReloadHandle(reload::Handle<EnvFilter, Registry>);

impl FilterReloadHandle {
    pub fn reload(&self, directives: &str) -> Result<()> {
        let filter = parse_filter(directives)?;
        self.0
            .reload(filter)
            .context("Failed to install new log filter")?;
        Ok(())
    }
}

fn parse_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse(directives)
        .context("Failed to parse log filter directives")
}

/// Installs a process-global `tracing` subscriber writing newline-delimited
/// output (or JSON, if `json` is set) to stdout.
///
/// Mirrors `logging::setup_global_subscriber` in the teacher codebase, minus
/// the Sentry layer: library crates never call this, only the two daemon
/// binaries (`meshnet-control-plane-server`, `meshnet-relay-forwarder`) do,
/// exactly once, at startup.
pub fn setup_global_subscriber(directives: &str, json: bool) -> Result<FilterReloadHandle> {
    let filter = parse_filter(directives)?;
    let (filter, reload_handle) = reload::Layer::new(filter);

    let subscriber = Registry::default().with(filter).with(match json {
        true => fmt::layer().json().flatten_event(true).boxed(),
        false => fmt::layer().boxed(),
    });

    subscriber
        .try_init()
        .context("Failed to install global tracing subscriber")?;

    Ok(FilterReloadHandle(reload_handle))
}
