// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const NOISY_MODULES: &str = "h2=info,hyper=info,hyper_util=info,reqwest=info,tokio_tungstenite=info,alloy_transport_http=info,alloy_rpc_client=info,alloy_pubsub=info";

/// A bare level gets the noisy-module defaults; custom directive strings
/// (with ',' or '=') are respected as-is.
pub fn filter_spec(log_level: &str) -> String {
    let normalized = log_level.trim();
    if normalized.is_empty() {
        return format!("info,{NOISY_MODULES}");
    }
    if normalized.contains(',') || normalized.contains('=') {
        normalized.to_string()
    } else {
        format!("{normalized},{NOISY_MODULES}")
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn setup_logging(log_level: &str, json_format: bool) {
    let filter_spec = filter_spec(log_level);
    let filter = EnvFilter::from_str(&filter_spec).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = if json_format {
        let json_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false);
        subscriber.with(json_layer).try_init().is_ok()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .compact();
        subscriber.with(fmt_layer).try_init().is_ok()
    };
    if !installed {
        return;
    }

    let base = filter_spec.split(',').next().unwrap_or("info").trim();
    tracing::info!(
        target: "engine",
        base,
        format = if json_format { "json" } else { "compact" },
        "Logging initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_levels_get_quiet_transports() {
        let spec = filter_spec("debug");
        assert!(spec.starts_with("debug,"));
        assert!(spec.contains("hyper=info"));
        assert!(EnvFilter::from_str(&spec).is_ok());
        assert!(filter_spec("").starts_with("info,"));
    }

    #[test]
    fn custom_directives_pass_through() {
        assert_eq!(filter_spec("warn,retry=trace"), "warn,retry=trace");
        assert_eq!(filter_spec(" pool=debug "), "pool=debug");
    }
}
