//! Control-plane HTTP API.
//!
//! Raw TCP + tokio, HTTP/1.1 with JSON bodies. One request per connection.
//! Node-facing routes (`/nodes/...`) carry registration, heartbeats, and
//! removal; operator routes (`/cluster/...`) expose state, events, and
//! manual failover; `/health`, `/ready`, `/status` serve probes.
//!
//! A rejected state transition is not a transport error: the report route
//! answers 200 with `accepted:false` and the unchanged goal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use heron_cluster::{FailoverOrchestrator, HealthMonitor, Registry};
use heron_cluster::registry::{NodeSpec, StateReport};
use heron_common::{GroupId, HeronError, NodeId};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Shared state behind every API connection.
pub struct AppState {
    cluster_name: String,
    registry: Arc<Registry>,
    orchestrator: Arc<FailoverOrchestrator>,
    monitor: Arc<HealthMonitor>,
    start_time: Instant,
    /// False during graceful shutdown so load balancers drain traffic.
    ready: AtomicBool,
    live: AtomicBool,
}

impl AppState {
    pub fn new(
        cluster_name: String,
        registry: Arc<Registry>,
        orchestrator: Arc<FailoverOrchestrator>,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            cluster_name,
            registry,
            orchestrator,
            monitor,
            start_time: Instant::now(),
            ready: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    #[allow(dead_code)]
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Optional body for `POST /cluster/{name}/failover`.
#[derive(Debug, Default, Deserialize)]
struct FailoverRequest {
    #[serde(default)]
    group_id: Option<u64>,
    #[serde(default)]
    target_node_id: Option<u64>,
}

/// Run the control-plane API server until `shutdown` resolves.
pub async fn run_api_server(
    addr: &str,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => {
            tracing::info!("Control-plane API listening on {}", addr);
            l
        }
        Err(e) => {
            tracing::error!("Failed to bind control-plane API on {}: {}", addr, e);
            return;
        }
    };

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(stream, &state).await {
                                tracing::debug!("API request error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!("API accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Control-plane API shutting down");
                break;
            }
        }
    }
}

async fn handle_request(
    mut stream: tokio::net::TcpStream,
    state: &AppState,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(raw) = read_http_request(&mut stream).await? else {
        return Ok(());
    };

    let (method, path, query, body) = match parse_request(&raw) {
        Some(parts) => parts,
        None => {
            let body = r#"{"error":"malformed request"}"#;
            write_response(&mut stream, 400, body).await?;
            return Ok(());
        }
    };

    let (route, status, response_body) = dispatch(state, &method, &path, &query, &body);
    heron_observability::record_api_request(route, status);
    write_response(&mut stream, status, &response_body).await?;
    Ok(())
}

/// Read one HTTP request: headers plus a Content-Length-delimited body.
async fn read_http_request(
    stream: &mut tokio::net::TcpStream,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut raw = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            if raw.is_empty() {
                return Ok(None);
            }
            return Ok(Some(raw));
        }
        raw.extend_from_slice(&buf[..n]);
        if raw.len() > MAX_REQUEST_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request too large",
            ));
        }
        if let Some(header_end) = find_header_end(&raw) {
            let headers = String::from_utf8_lossy(&raw[..header_end]);
            let content_length = headers
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if raw.len() >= header_end + 4 + content_length {
                return Ok(Some(raw));
            }
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Split a raw request into (method, path, query, body).
fn parse_request(raw: &[u8]) -> Option<(String, String, String, Vec<u8>)> {
    let header_end = find_header_end(raw)?;
    let headers = std::str::from_utf8(&raw[..header_end]).ok()?;
    let mut request_line = headers.lines().next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?;
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };
    let body = raw[header_end + 4..].to_vec();
    Some((method, path, query, body))
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .find_map(|pair| pair.split_once('=').filter(|(k, _)| *k == key))
        .map(|(_, v)| v)
}

fn parse_node_id(segment: &str) -> Result<NodeId, HeronError> {
    segment
        .parse::<u64>()
        .map(NodeId)
        .map_err(|_| HeronError::Config(format!("invalid node id '{}'", segment)))
}

fn error_response(err: &HeronError) -> (u16, String) {
    err.log_if_fatal();
    (err.http_status(), json!({ "error": err.to_string() }).to_string())
}

/// Route one request. Returns (route label for metrics, status, JSON body).
fn dispatch(
    state: &AppState,
    method: &str,
    path: &str,
    query: &str,
    body: &[u8],
) -> (&'static str, u16, String) {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        ("POST", ["nodes"]) => {
            let (status, body) = register_node(state, body);
            ("register", status, body)
        }
        ("POST", ["nodes", id, "report"]) => {
            let (status, body) = report_state(state, id, body);
            ("report", status, body)
        }
        ("POST", ["nodes", id, "maintenance:on"]) => {
            let (status, body) = maintenance(state, id, true);
            ("maintenance", status, body)
        }
        ("POST", ["nodes", id, "maintenance:off"]) => {
            let (status, body) = maintenance(state, id, false);
            ("maintenance", status, body)
        }
        ("DELETE", ["nodes", id]) => {
            let force = query_param(query, "force") == Some("true");
            let (status, body) = remove_node(state, id, force);
            ("remove", status, body)
        }
        ("GET", ["cluster", name, "state"]) => {
            let (status, body) = cluster_state(state, name);
            ("cluster_state", status, body)
        }
        ("POST", ["cluster", name, "failover"]) => {
            let (status, body) = failover(state, name, body);
            ("failover", status, body)
        }
        ("POST", ["cluster", name, "promote", id]) => {
            let (status, body) = promote(state, name, id);
            ("promote", status, body)
        }
        ("GET", ["cluster", name, "events"]) => {
            let (status, body) = cluster_events(state, name, query);
            ("events", status, body)
        }
        ("GET", ["health"]) => {
            let body = json!({
                "status": "ok",
                "live": state.is_live(),
                "uptime_secs": state.uptime_secs(),
                "cluster": state.cluster_name,
            })
            .to_string();
            let status = if state.is_live() { 200 } else { 503 };
            ("health", status, body)
        }
        ("GET", ["ready"]) => {
            if state.is_ready() {
                let body = json!({
                    "ready": true,
                    "cluster": state.cluster_name,
                    "uptime_secs": state.uptime_secs(),
                })
                .to_string();
                ("ready", 200, body)
            } else {
                let body = json!({
                    "ready": false,
                    "reason": "shutting down or bootstrapping",
                })
                .to_string();
                ("ready", 503, body)
            }
        }
        ("GET", ["status"]) => {
            let snapshot = state.monitor.snapshot();
            let nodes = state.registry.list_live();
            let body = json!({
                "status": "ok",
                "cluster": state.cluster_name,
                "live": state.is_live(),
                "ready": state.is_ready(),
                "uptime_secs": state.uptime_secs(),
                "nodes": nodes.len(),
                "overall_health": snapshot.overall.as_str(),
                "checks_performed": snapshot.checks_performed,
                "events": state.registry.events().len(),
            })
            .to_string();
            ("status", 200, body)
        }
        _ => (
            "unknown",
            404,
            r#"{"error":"not found"}"#.to_string(),
        ),
    }
}

// ── route handlers ───────────────────────────────────────────────────────

fn register_node(state: &AppState, body: &[u8]) -> (u16, String) {
    let spec: NodeSpec = match serde_json::from_slice(body) {
        Ok(spec) => spec,
        Err(e) => {
            return error_response(&HeronError::Config(format!("invalid request body: {}", e)))
        }
    };
    if spec.cluster_name != state.cluster_name {
        return error_response(&HeronError::ClusterNotFound(spec.cluster_name));
    }
    match state.orchestrator.register_node(spec) {
        Ok(record) => match serde_json::to_string(&record) {
            Ok(body) => (200, body),
            Err(e) => error_response(&HeronError::Internal(e.to_string())),
        },
        Err(e) => error_response(&e),
    }
}

fn report_state(state: &AppState, id: &str, body: &[u8]) -> (u16, String) {
    let node_id = match parse_node_id(id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    let report: StateReport = match serde_json::from_slice(body) {
        Ok(report) => report,
        Err(e) => {
            return error_response(&HeronError::Config(format!("invalid request body: {}", e)))
        }
    };
    match state.orchestrator.handle_report(node_id, report) {
        Ok(outcome) => match serde_json::to_string(&outcome) {
            Ok(body) => (200, body),
            Err(e) => error_response(&HeronError::Internal(e.to_string())),
        },
        Err(e) => error_response(&e),
    }
}

fn maintenance(state: &AppState, id: &str, on: bool) -> (u16, String) {
    let node_id = match parse_node_id(id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    let result = if on {
        state.registry.start_maintenance(node_id)
    } else {
        state.registry.stop_maintenance(node_id)
    };
    match result {
        Ok(()) => (200, json!({ "ok": true, "maintenance": on }).to_string()),
        Err(e) => error_response(&e),
    }
}

fn remove_node(state: &AppState, id: &str, force: bool) -> (u16, String) {
    let node_id = match parse_node_id(id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.orchestrator.remove_node(node_id, force) {
        Ok(()) => (200, json!({ "ok": true }).to_string()),
        Err(e) => error_response(&e),
    }
}

fn check_cluster(state: &AppState, name: &str) -> Result<(), HeronError> {
    if name == state.cluster_name {
        Ok(())
    } else {
        Err(HeronError::ClusterNotFound(name.to_string()))
    }
}

fn cluster_state(state: &AppState, name: &str) -> (u16, String) {
    if let Err(e) = check_cluster(state, name) {
        return error_response(&e);
    }
    let nodes: Vec<serde_json::Value> = state
        .registry
        .list_live()
        .iter()
        .map(|n| {
            json!({
                "node_id": n.node_id,
                "group_id": n.group_id,
                "name": n.name,
                "host": n.host,
                "port": n.port,
                "reported_state": n.reported_state,
                "goal_state": n.goal_state,
                "candidate_priority": n.candidate_priority,
                "quorum_member": n.replication_quorum_member,
                "timeline": n.reported_timeline,
                "lsn": n.reported_lsn,
                "health": n.health,
            })
        })
        .collect();
    let groups: Vec<serde_json::Value> = state
        .registry
        .live_groups()
        .iter()
        .map(|g| {
            let decision = state.orchestrator.last_decision(*g);
            match decision {
                Some(d) => json!({
                    "group_id": g,
                    "has_quorum": d.has_quorum,
                    "healthy_nodes": d.healthy_node_count,
                    "total_nodes": d.total_node_count,
                    "votes_required": d.votes_required,
                    "split_brain": d.split_brain_detected,
                    "reason": d.decision_reason,
                }),
                None => json!({ "group_id": g, "reason": "not yet evaluated" }),
            }
        })
        .collect();
    let body = json!({ "cluster": state.cluster_name, "nodes": nodes, "groups": groups });
    (200, body.to_string())
}

fn failover(state: &AppState, name: &str, body: &[u8]) -> (u16, String) {
    if let Err(e) = check_cluster(state, name) {
        return error_response(&e);
    }
    let request: FailoverRequest = if body.iter().all(|b| b.is_ascii_whitespace()) {
        FailoverRequest::default()
    } else {
        match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                return error_response(&HeronError::Config(format!(
                    "invalid request body: {}",
                    e
                )))
            }
        }
    };
    let group_id = GroupId(request.group_id.unwrap_or(0));
    let target = request.target_node_id.map(NodeId);
    match state.orchestrator.manual_failover(group_id, target) {
        Ok(promoted) => {
            heron_observability::record_failover("manual");
            (200, json!({ "promoted_node_id": promoted }).to_string())
        }
        Err(e) => error_response(&e),
    }
}

fn promote(state: &AppState, name: &str, id: &str) -> (u16, String) {
    if let Err(e) = check_cluster(state, name) {
        return error_response(&e);
    }
    let node_id = match parse_node_id(id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.orchestrator.promote_node(node_id) {
        Ok(promoted) => {
            heron_observability::record_failover("promote");
            (200, json!({ "promoted_node_id": promoted }).to_string())
        }
        Err(e) => error_response(&e),
    }
}

fn cluster_events(state: &AppState, name: &str, query: &str) -> (u16, String) {
    if let Err(e) = check_cluster(state, name) {
        return error_response(&e);
    }
    let limit = query_param(query, "limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100);
    let events = state.registry.events().recent(limit);
    match serde_json::to_string(&json!({ "events": events })) {
        Ok(body) => (200, body),
        Err(e) => error_response(&HeronError::Internal(e.to_string())),
    }
}

async fn write_response(
    stream: &mut tokio::net::TcpStream,
    status: u16,
    body: &str,
) -> std::io::Result<()> {
    let status_text = match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        404 => "404 Not Found",
        409 => "409 Conflict",
        412 => "412 Precondition Failed",
        503 => "503 Service Unavailable",
        _ => "500 Internal Server Error",
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_text,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
