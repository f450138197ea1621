// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Optional health endpoint for liveness/readiness probes

use crate::registry::Core;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Serve `/`, `/health` and `/ready` when HEALTH_PORT is configured
pub fn spawn(core: Arc<Core>) -> Option<JoinHandle<()>> {
    let port = core.settings.health_port;

    if port == 0 {
        return None;
    }

    let router = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/ready", get(health))
        .with_state(core);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    Some(tokio::spawn(async move {
        log::info!("health endpoint listening on {addr}");

        if let Err(e) = axum::Server::bind(&addr)
            .serve(router.into_make_service())
            .await
        {
            log::error!("health endpoint failed: {e}");
        }
    }))
}

async fn health(State(core): State<Arc<Core>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_s": core.uptime().as_secs(),
        "rss_mb": resident_set_mb(),
        "heapUsed_mb": serde_json::Value::Null,
        "pbxConnected": core.pbx_connected.load(Ordering::Acquire),
        "pid": std::process::id(),
        "started": core.started.to_rfc3339(),
        "activeCalls": core.call_count(),
    }))
}

/// Resident set size in MiB, read from procfs; 0.0 where unavailable
fn resident_set_mb() -> f64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0.0;
    };

    let Some(resident_pages) = statm
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
    else {
        return 0.0;
    };

    // Page size is 4 KiB on every platform this runs on
    (resident_pages * 4096) as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resident_set_is_positive_on_linux() {
        if std::path::Path::new("/proc/self/statm").exists() {
            assert!(resident_set_mb() > 0.0);
        }
    }
}
