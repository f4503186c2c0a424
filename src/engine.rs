//! Campaign execution engine: a deadline-bounded request emitter feeding a
//! fixed pool of download workers, with a collector folding the responses
//! into the final summary.
//!
//! The emitter is the only producer of work items and the workers the only
//! consumers; the bounded channels (capacity = pool size) are the only
//! cross-task communication. No locks are held around the counters.

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::checksum::{ChecksumAlgorithm, ChecksumMode};
use crate::transport::{ClientOptions, DownloadError, FileClient};
use crate::types::{LoadRequest, LoadResponse};
use crate::util::MB;

/// A download operation queued for execution by a worker.
pub struct DownloadReq {
    pub seq: u64,
    pub server: String,
    pub client: Arc<FileClient>,
    pub file_id: String,
    pub size: u64,
    pub not_after: Instant,
    pub reply_to: mpsc::Sender<DownloadResp>,
}

/// What a worker sends back after executing one download.
pub struct DownloadResp {
    pub seq: u64,
    pub size: u64,
    pub err: Option<DownloadError>,
}

/// Pick the effective worker count for a campaign: 0 means twice the CPU
/// count, and anything is clamped to `[1, 1000 * NCPU]`.
pub fn effective_concurrency(requested: usize) -> usize {
    let ncpu = num_cpus::get();
    let n = if requested == 0 { 2 * ncpu } else { requested };
    n.clamp(1, 1000 * ncpu)
}

/// Sample a file size from N(mean, std); draws below zero collapse to 0,
/// which the server rejects and the campaign counts as an error.
pub fn sample_size(mean: u64, std: u64, z: f64) -> u64 {
    let sampled = mean as f64 + std as f64 * z;
    if sampled < 0.0 {
        0
    } else {
        sampled as u64
    }
}

/// TLS material the client agent passes to every transport it builds.
#[derive(Debug, Clone)]
pub struct TransportCredentials {
    pub ca: std::path::PathBuf,
    pub cert: Option<std::path::PathBuf>,
    pub key: Option<std::path::PathBuf>,
}

/// Execute one campaign described by `req`, returning its summary.
pub async fn run_campaign(
    req: &LoadRequest,
    credentials: &TransportCredentials,
) -> anyhow::Result<LoadResponse> {
    let workers = effective_concurrency(req.concurrency);

    // One reusable transport per distinct server address
    let options = ClientOptions {
        use_http1: req.use_http1,
        plain_http: req.plain_http,
        ca: credentials.ca.clone(),
        cert: credentials.cert.clone(),
        key: credentials.key.clone(),
    };
    let mut transports = Vec::with_capacity(req.server_addrs.len());
    for _ in &req.server_addrs {
        transports.push(Arc::new(FileClient::new(&options)?));
    }

    let (req_tx, req_rx) = mpsc::channel::<DownloadReq>(workers);
    let (resp_tx, resp_rx) = mpsc::channel::<DownloadResp>(workers);
    let (summary_tx, summary_rx) = oneshot::channel::<LoadResponse>();

    // Collector starts consuming before any work is emitted
    tokio::spawn(collect_responses(workers, resp_rx, summary_tx));

    info!("starting {} workers", workers);
    let req_rx = Arc::new(Mutex::new(req_rx));
    let mut worker_set = JoinSet::new();
    for id in 0..workers {
        worker_set.spawn(worker_loop(id, req_rx.clone()));
    }

    let emitter = tokio::spawn(emit_requests(
        req.clone(),
        transports.clone(),
        req_tx,
        resp_tx,
    ));

    // Workers exit once the emitter closes the request channel and the
    // backlog is drained
    while worker_set.join_next().await.is_some() {}
    debug!("all workers finished execution");
    let _ = emitter.await;

    // Every response sender is gone now, so the collector observes the
    // close and emits exactly one summary
    let summary = summary_rx.await?;

    // Release per-server transports, closing their pooled connections
    drop(transports);

    Ok(summary)
}

/// Produce download requests until the deadline elapses. Each loop turn
/// races "deadline fired" against "channel accepted the item"; the request
/// channel closes when this task returns.
async fn emit_requests(
    req: LoadRequest,
    transports: Vec<Arc<FileClient>>,
    req_tx: mpsc::Sender<DownloadReq>,
    resp_tx: mpsc::Sender<DownloadResp>,
) {
    let duration = req.duration();
    let not_after = Instant::now() + duration;
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    let mut rng = StdRng::from_entropy();
    let mut seq: u64 = 0;
    loop {
        seq += 1;
        let target = rng.gen_range(0..req.server_addrs.len());
        let z: f64 = rng.sample(StandardNormal);
        let item = DownloadReq {
            seq,
            server: req.server_addrs[target].clone(),
            client: transports[target].clone(),
            file_id: format!("file-{}", seq),
            size: sample_size(req.mean_size, req.std_size, z),
            not_after,
            reply_to: resp_tx.clone(),
        };
        tokio::select! {
            _ = &mut deadline => break,
            sent = req_tx.send(item) => {
                if sent.is_err() {
                    warn!("request channel closed before deadline");
                    break;
                }
            }
        }
    }
    debug!("stopped emitting download requests after {} items", seq);
}

/// Worker task: executes queued downloads until the request channel closes.
/// Items whose deadline already passed are dropped without a response.
async fn worker_loop(id: usize, req_rx: Arc<Mutex<mpsc::Receiver<DownloadReq>>>) {
    loop {
        let item = { req_rx.lock().await.recv().await };
        let Some(item) = item else { break };
        if Instant::now() > item.not_after {
            continue;
        }
        debug!(
            "worker {}: processing download seq={} server={} size={}",
            id, item.seq, item.server, item.size
        );
        let report = item
            .client
            .download_file(
                &item.server,
                &item.file_id,
                item.size,
                ChecksumMode::None,
                ChecksumAlgorithm::Sha256,
                &mut tokio::io::sink(),
            )
            .await;
        let resp = DownloadResp {
            seq: item.seq,
            size: item.size,
            err: report.err,
        };
        let _ = item.reply_to.send(resp).await;
    }
}

/// Fold worker responses into the campaign summary. Emits once, when the
/// response channel closes.
async fn collect_responses(
    concurrency: usize,
    mut resp_rx: mpsc::Receiver<DownloadResp>,
    summary_tx: oneshot::Sender<LoadResponse>,
) {
    let start = Utc::now();
    let started = Instant::now();
    let mut num_files: u64 = 0;
    let mut err_count: u64 = 0;
    let mut data_size: f64 = 0.0;
    while let Some(resp) = resp_rx.recv().await {
        match resp.err {
            Some(e) => {
                err_count += 1;
                debug!("error from worker: seq={} {}", resp.seq, e);
            }
            None => {
                num_files += 1;
                data_size += resp.size as f64 / MB as f64;
            }
        }
    }
    let end = Utc::now();
    let elapsed = started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 { data_size / elapsed } else { 0.0 };
    let _ = summary_tx.send(LoadResponse {
        start,
        end,
        concurrency,
        num_files,
        data_size,
        rate,
        err_count,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_zero_means_twice_ncpu() {
        assert_eq!(effective_concurrency(0), 2 * num_cpus::get());
    }

    #[test]
    fn concurrency_is_clamped_to_ncpu_bound() {
        let ncpu = num_cpus::get();
        assert_eq!(effective_concurrency(1000 * ncpu + 1), 1000 * ncpu);
        assert_eq!(effective_concurrency(4), 4);
    }

    #[test]
    fn sample_size_follows_mean_and_std() {
        assert_eq!(sample_size(1000, 100, 0.0), 1000);
        assert_eq!(sample_size(1000, 100, 1.0), 1100);
        assert_eq!(sample_size(1000, 100, -1.0), 900);
    }

    #[test]
    fn sample_size_clamps_negative_draws_to_zero() {
        assert_eq!(sample_size(100, 1000, -10.0), 0);
    }

    #[tokio::test]
    async fn campaign_against_unreachable_server_counts_errors() {
        let req = LoadRequest {
            server_addrs: vec!["127.0.0.1:1".to_string()],
            duration_secs: 0.5,
            concurrency: 2,
            mean_size: 1024,
            std_size: 0,
            use_http1: false,
            plain_http: true,
        };
        let credentials = TransportCredentials {
            ca: std::path::PathBuf::from("unused.pem"),
            cert: None,
            key: None,
        };
        let summary = run_campaign(&req, &credentials).await.unwrap();
        assert_eq!(summary.num_files, 0);
        assert!(summary.err_count > 0);
        assert_eq!(summary.concurrency, 2);
    }
}
