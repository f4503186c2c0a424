//! Driver: fans the same load specification out to every client agent,
//! collects their reports and prints the campaign summary.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::CONTENT_TYPE;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::types::{LoadRequest, LoadResponse};
use crate::util::{split_and_clean, MB};

/// Standard deviation of file sizes, as a fraction of the mean.
pub const DEFAULT_STD_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Comma-separated client agent addresses (host:port)
    pub clients: String,
    /// Comma-separated file server addresses (host:port)
    pub servers: String,
    /// Campaign duration in seconds; negative values are made absolute
    pub duration_secs: f64,
    /// Concurrent downloads per client; 0 lets each client pick
    pub concurrency: usize,
    /// Mean file size in MB
    pub mean_size_mb: u64,
    /// Use HTTP/1.1 on the data plane instead of HTTP/2
    pub use_http1: bool,
    /// Use plain HTTP (no TLS) on the data plane
    pub plain_http: bool,
}

/// Outcome of one client's participation in the campaign.
#[derive(Debug)]
pub struct LoadReport {
    pub client: String,
    pub response: Option<LoadResponse>,
    pub err: Option<String>,
}

/// Run a campaign: send the load request to every client, print per-client
/// reports as they arrive, then the summary. Per-client failures are part
/// of the report, not an error of the driver itself.
pub async fn run(options: &DriverOptions) -> anyhow::Result<()> {
    let client_addrs = split_and_clean(&options.clients);
    let mean_size = options.mean_size_mb * MB;
    let load = LoadRequest {
        server_addrs: split_and_clean(&options.servers),
        duration_secs: options.duration_secs.abs(),
        concurrency: options.concurrency,
        mean_size,
        std_size: (DEFAULT_STD_FRACTION * mean_size as f64) as u64,
        use_http1: options.use_http1,
        plain_http: options.plain_http,
    };

    let (report_tx, report_rx) = mpsc::channel::<LoadReport>(client_addrs.len());
    let collector = tokio::spawn(collect_reports(client_addrs.len(), report_rx));

    let mut senders = JoinSet::new();
    for client in client_addrs {
        let load = load.clone();
        let report_tx = report_tx.clone();
        senders.spawn(async move {
            let report = send_load_request(&client, &load).await;
            let _ = report_tx.send(report).await;
        });
    }
    drop(report_tx);
    while senders.join_next().await.is_some() {}
    debug!("finished sending requests to clients");

    collector.await?;
    Ok(())
}

/// POST the load request to one client and wrap the outcome in a report.
async fn send_load_request(client_addr: &str, load: &LoadRequest) -> LoadReport {
    match post_load(client_addr, load).await {
        Ok(response) => LoadReport {
            client: client_addr.to_string(),
            response: Some(response),
            err: None,
        },
        Err(e) => LoadReport {
            client: client_addr.to_string(),
            response: None,
            err: Some(format!(
                "could not submit load request to client '{}': {:#}",
                client_addr, e
            )),
        },
    }
}

async fn post_load(client_addr: &str, load: &LoadRequest) -> anyhow::Result<LoadResponse> {
    let uri: Uri = format!("http://{}/load", client_addr).parse()?;
    let body = serde_json::to_vec(load)?;
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json; charset=utf-8")
        .body(Full::new(Bytes::from(body)))?;

    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let response = client.request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    if status != StatusCode::OK {
        anyhow::bail!("client returned {}: {}", status, String::from_utf8_lossy(&body));
    }
    Ok(serde_json::from_slice(&body)?)
}

/// Receive exactly `n` reports, printing each as it arrives, then print
/// the cross-client summary.
async fn collect_reports(n: usize, mut report_rx: mpsc::Receiver<LoadReport>) {
    let mut reports = Vec::with_capacity(n);
    for _ in 0..n {
        let Some(report) = report_rx.recv().await else {
            break;
        };
        print_report(&report);
        reports.push(report);
    }
    print_summary(&summarize(&reports));
}

fn print_report(report: &LoadReport) {
    match (&report.response, &report.err) {
        (Some(response), _) => {
            println!("download report");
            println!("\tclient:           '{}'", report.client);
            println!("\tconcurrency:      {}", response.concurrency);
            println!("\telapsed time:     {}", format_elapsed(response.start, response.end));
            println!("\tfiles downloaded: {}", response.num_files);
            println!("\tdata volume:      {:.2} MB", response.data_size);
            println!("\tdownload rate:    {:.2} MB/sec", response.rate);
            println!("\terrors:           {}", response.err_count);
        }
        (None, Some(err)) => {
            println!("received error from client {}: {}", report.client, err);
        }
        (None, None) => {}
    }
}

/// Cross-client aggregation of a campaign.
#[derive(Debug, Default)]
pub struct CampaignSummary {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub data_size: f64,
    pub num_files: u64,
    pub download_errors: u64,
    pub client_errors: Vec<String>,
}

fn summarize(reports: &[LoadReport]) -> CampaignSummary {
    let mut summary = CampaignSummary::default();
    for report in reports {
        match (&report.response, &report.err) {
            (Some(response), _) => {
                summary.start = Some(match summary.start {
                    Some(start) => start.min(response.start),
                    None => response.start,
                });
                summary.end = Some(match summary.end {
                    Some(end) => end.max(response.end),
                    None => response.end,
                });
                summary.data_size += response.data_size;
                summary.num_files += response.num_files;
                summary.download_errors += response.err_count;
            }
            (None, Some(err)) => summary.client_errors.push(err.clone()),
            (None, None) => {}
        }
    }
    summary
}

fn print_summary(summary: &CampaignSummary) {
    for err in &summary.client_errors {
        println!("   ERROR {}", err);
    }
    println!("Summary:");
    println!("   download operations: {}", summary.num_files);
    println!("   data volume:         {:.2} MB", summary.data_size);
    if summary.num_files > 0 {
        println!(
            "   avg file size:       {:.2} MB",
            summary.data_size / summary.num_files as f64
        );
    }
    if let (Some(start), Some(end)) = (summary.start, summary.end) {
        let elapsed = elapsed_seconds(start, end);
        if elapsed > 0.0 {
            println!(
                "   download rate:       {:.2} MB/sec",
                summary.data_size / elapsed
            );
        }
    }
    if summary.download_errors > 0 {
        println!("   download errors:     {}", summary.download_errors);
    }
    if !summary.client_errors.is_empty() {
        println!("   client errors:       {}", summary.client_errors.len());
    }
}

fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

fn format_elapsed(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!("{:.3}s", elapsed_seconds(start, end))
}
