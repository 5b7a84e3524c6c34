// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@on1.no>

use crate::domain::events::EngineEvent;
use crate::domain::types::JobState;
use crate::network::pool::PoolStats;
use crate::services::engine::Engine;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Engine-wide counters, fed from the event bus.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub jobs_submitted: AtomicU64,
    pub attempts: AtomicU64,
    pub replacements: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub jobs_confirmed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_timed_out: AtomicU64,
    pub gas_fallbacks: AtomicU64,
    pub connections_created: AtomicU64,
    pub connections_removed: AtomicU64,
    pub connections_unhealthy: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub jobs_submitted: u64,
    pub attempts: u64,
    pub replacements: u64,
    pub retries_scheduled: u64,
    pub jobs_confirmed: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub gas_fallbacks: u64,
    pub connections_created: u64,
    pub connections_removed: u64,
    pub connections_unhealthy: u64,
}

impl EngineStats {
    pub fn record_submission(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe(&self, event: &EngineEvent) {
        let counter = match event {
            EngineEvent::ConnectionCreated { .. } => &self.connections_created,
            EngineEvent::ConnectionRemoved { .. } => &self.connections_removed,
            EngineEvent::ConnectionUnhealthy { .. } => &self.connections_unhealthy,
            EngineEvent::GasFallback { .. } => &self.gas_fallbacks,
            EngineEvent::AttemptStarted { .. } => &self.attempts,
            EngineEvent::ReplacementSent { .. } => &self.replacements,
            EngineEvent::RetryScheduled { .. } => &self.retries_scheduled,
            EngineEvent::JobTerminal { state, .. } => match state {
                JobState::Confirmed => &self.jobs_confirmed,
                JobState::Timeout => &self.jobs_timed_out,
                _ => &self.jobs_failed,
            },
            EngineEvent::JobStateChanged { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            jobs_submitted: load(&self.jobs_submitted),
            attempts: load(&self.attempts),
            replacements: load(&self.replacements),
            retries_scheduled: load(&self.retries_scheduled),
            jobs_confirmed: load(&self.jobs_confirmed),
            jobs_failed: load(&self.jobs_failed),
            jobs_timed_out: load(&self.jobs_timed_out),
            gas_fallbacks: load(&self.gas_fallbacks),
            connections_created: load(&self.connections_created),
            connections_removed: load(&self.connections_removed),
            connections_unhealthy: load(&self.connections_unhealthy),
        }
    }
}

pub async fn spawn_metrics_server(port: u16, engine: Arc<Engine>) -> Option<SocketAddr> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(target: "metrics", error = %e, "Metrics server failed to bind");
            return None;
        }
    };

    let local = listener.local_addr().ok();
    if let Some(addr) = local {
        tracing::info!(target: "metrics", %addr, "Metrics server listening");
    }

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let mut buf = [0u8; 1024];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let req = String::from_utf8_lossy(&buf[..n]).to_string();
                    let path = req
                        .lines()
                        .next()
                        .and_then(|l| l.split_whitespace().nth(1))
                        .unwrap_or("/");
                    let (route, _query) = path.split_once('?').unwrap_or((path, ""));

                    let (content_type, body) = if route.starts_with("/status") {
                        ("application/json", render_status_json(&engine))
                    } else {
                        let pools = pool_stats_by_network(&engine);
                        (
                            "text/plain",
                            render_metrics(&engine.stats().snapshot(), &pools, engine.active_jobs()),
                        )
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
                        content_type,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                }
                Err(e) => {
                    tracing::warn!(target: "metrics", error = %e, "Metrics accept error");
                    continue;
                }
            }
        }
    });

    local
}

fn pool_stats_by_network(engine: &Engine) -> Vec<(String, PoolStats)> {
    engine
        .networks()
        .into_iter()
        .filter_map(|name| {
            let stats = engine.get_pool_stats(Some(&name)).ok()?;
            Some((name, stats))
        })
        .collect()
}

fn render_metrics(
    stats: &EngineStatsSnapshot,
    pools: &[(String, PoolStats)],
    active_jobs: usize,
) -> String {
    let mut body = format!(
        concat!(
            "# TYPE engine_jobs_submitted counter\nengine_jobs_submitted {}\n",
            "# TYPE engine_jobs_confirmed counter\nengine_jobs_confirmed {}\n",
            "# TYPE engine_jobs_failed counter\nengine_jobs_failed {}\n",
            "# TYPE engine_jobs_timed_out counter\nengine_jobs_timed_out {}\n",
            "# TYPE engine_jobs_active gauge\nengine_jobs_active {}\n",
            "# TYPE engine_attempts counter\nengine_attempts {}\n",
            "# TYPE engine_replacements counter\nengine_replacements {}\n",
            "# TYPE engine_retries_scheduled counter\nengine_retries_scheduled {}\n",
            "# TYPE engine_gas_fallbacks counter\nengine_gas_fallbacks {}\n",
            "# TYPE engine_connections_created counter\nengine_connections_created {}\n",
            "# TYPE engine_connections_removed counter\nengine_connections_removed {}\n",
            "# TYPE engine_connections_unhealthy counter\nengine_connections_unhealthy {}\n"
        ),
        stats.jobs_submitted,
        stats.jobs_confirmed,
        stats.jobs_failed,
        stats.jobs_timed_out,
        active_jobs,
        stats.attempts,
        stats.replacements,
        stats.retries_scheduled,
        stats.gas_fallbacks,
        stats.connections_created,
        stats.connections_removed,
        stats.connections_unhealthy,
    );

    if !pools.is_empty() {
        body.push_str("# TYPE pool_connections gauge\n");
        for (network, pool) in pools {
            body.push_str(&format!(
                "pool_connections{{network=\"{}\",state=\"available\"}} {}\npool_connections{{network=\"{}\",state=\"busy\"}} {}\n",
                network, pool.available, network, pool.busy
            ));
        }
        body.push_str("# TYPE pool_requests counter\n");
        for (network, pool) in pools {
            body.push_str(&format!(
                "pool_requests{{network=\"{}\"}} {}\n",
                network, pool.total_requests
            ));
        }
        body.push_str("# TYPE pool_request_failures counter\n");
        for (network, pool) in pools {
            body.push_str(&format!(
                "pool_request_failures{{network=\"{}\"}} {}\n",
                network, pool.total_failures
            ));
        }
        body.push_str("# TYPE pool_average_latency_ms gauge\n");
        for (network, pool) in pools {
            body.push_str(&format!(
                "pool_average_latency_ms{{network=\"{}\"}} {:.3}\n",
                network, pool.average_latency_ms
            ));
        }
    }

    body
}

fn render_status_json(engine: &Engine) -> String {
    let stats = engine.stats().snapshot();
    let mut pools = serde_json::Map::new();
    for (network, pool) in pool_stats_by_network(engine) {
        pools.insert(network, json!(pool));
    }
    let success_rate = if stats.jobs_submitted > 0 {
        (stats.jobs_confirmed as f64) / (stats.jobs_submitted as f64) * 100.0
    } else {
        0.0
    };

    json!({
        "uptimeSecs": engine.uptime_secs(),
        "activeJobs": engine.active_jobs(),
        "signer": engine.signer_address().map(|a| format!("{a:#x}")),
        "successRate": success_rate,
        "stats": stats,
        "pools": pools,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ConnectionId, JobId};

    #[test]
    fn terminal_events_land_in_their_bucket() {
        let stats = EngineStats::default();
        for state in [JobState::Confirmed, JobState::Failed, JobState::Timeout, JobState::Confirmed] {
            stats.observe(&EngineEvent::JobTerminal {
                job: JobId(1),
                network: "mainnet".into(),
                state,
                attempts: 1,
                hash: None,
            });
        }
        stats.observe(&EngineEvent::ConnectionCreated {
            network: "mainnet".into(),
            id: ConnectionId(1),
            endpoint: "http://a".into(),
        });
        let snap = stats.snapshot();
        assert_eq!(snap.jobs_confirmed, 2);
        assert_eq!(snap.jobs_failed, 1);
        assert_eq!(snap.jobs_timed_out, 1);
        assert_eq!(snap.connections_created, 1);
    }

    #[test]
    fn renders_labelled_pool_series() {
        let snap = EngineStatsSnapshot {
            jobs_submitted: 3,
            ..EngineStatsSnapshot::default()
        };
        let pools = vec![(
            "polygon".to_string(),
            PoolStats {
                size: 2,
                available: 1,
                busy: 1,
                total_requests: 10,
                total_failures: 1,
                success_rate: 0.9,
                average_latency_ms: 12.5,
            },
        )];
        let body = render_metrics(&snap, &pools, 1);
        assert!(body.contains("engine_jobs_submitted 3\n"));
        assert!(body.contains("engine_jobs_active 1\n"));
        assert!(body.contains("pool_connections{network=\"polygon\",state=\"busy\"} 1\n"));
        assert!(body.contains("pool_requests{network=\"polygon\"} 10\n"));
        assert!(body.contains("pool_average_latency_ms{network=\"polygon\"} 12.500\n"));
    }
}
