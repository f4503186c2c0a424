use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Load specification the driver sends to every client agent
/// (`POST /load` body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Network addresses (host:port) of the file servers involved in this test
    pub server_addrs: Vec<String>,

    /// Duration of the emission window, in seconds
    pub duration_secs: f64,

    /// Number of concurrent download operations; 0 lets the client pick
    pub concurrency: usize,

    /// Mean and standard deviation of the requested file sizes (bytes)
    pub mean_size: u64,
    pub std_size: u64,

    /// Use HTTP/1.1 for download operations instead of the default HTTP/2
    #[serde(default)]
    pub use_http1: bool,

    /// Use plain HTTP (no TLS) on the data plane
    #[serde(default)]
    pub plain_http: bool,
}

impl LoadRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.server_addrs.is_empty() {
            return Err("server addresses not included in load request".to_string());
        }
        if self.duration_secs.is_nan() || self.duration_secs < 0.0 {
            return Err(format!("invalid duration {}s", self.duration_secs));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.abs())
    }
}

/// Per-client campaign summary returned to the driver
/// (`POST /load` response body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponse {
    /// Start and end of the emission window as observed by the collector
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    /// Number of concurrent download operations actually used
    pub concurrency: usize,

    /// Number of files downloaded in this test
    pub num_files: u64,

    /// Volume of data downloaded in this test (MB)
    pub data_size: f64,

    /// Download rate for this test (MB/sec)
    pub rate: f64,

    /// Number of errors observed in this test
    pub err_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LoadRequest {
        LoadRequest {
            server_addrs: vec!["localhost:9443".to_string()],
            duration_secs: 2.0,
            concurrency: 4,
            mean_size: 1 << 20,
            std_size: 1 << 18,
            use_http1: false,
            plain_http: false,
        }
    }

    #[test]
    fn validate_accepts_well_formed() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_servers() {
        let mut req = request();
        req.server_addrs.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_negative_duration() {
        let mut req = request();
        req.duration_secs = -1.0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_nan_duration() {
        let mut req = request();
        req.duration_secs = f64::NAN;
        assert!(req.validate().is_err());
    }

    #[test]
    fn json_round_trip() {
        let req = request();
        let blob = serde_json::to_vec(&req).unwrap();
        let back: LoadRequest = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back.server_addrs, req.server_addrs);
        assert_eq!(back.concurrency, req.concurrency);
        assert_eq!(back.mean_size, req.mean_size);
    }

    #[test]
    fn optional_flags_default_to_false() {
        let blob = r#"{"server_addrs":["a:1"],"duration_secs":1.0,"concurrency":0,"mean_size":1,"std_size":0}"#;
        let req: LoadRequest = serde_json::from_slice(blob.as_bytes()).unwrap();
        assert!(!req.use_http1);
        assert!(!req.plain_http);
    }
}
