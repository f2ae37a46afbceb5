//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live connection actors.
    pub connections: usize,
    /// Registered route paths.
    pub routes: Vec<String>,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, routes: Vec<String>) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        routes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, Vec::new());
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, 0, Vec::new()).uptime_secs >= 59);
    }

    #[test]
    fn serializes_counters() {
        let resp = health_check(Instant::now(), 3, vec!["/ws".into()]);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["connections"], 3);
        assert_eq!(json["routes"][0], "/ws");
    }
}
