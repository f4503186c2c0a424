pub mod agent;
pub mod checksum;
pub mod driver;
pub mod engine;
pub mod payload;
pub mod server;
pub mod tls;
pub mod transport;
pub mod types;
pub mod util;

pub use agent::Agent;
pub use checksum::{ChecksumAlgorithm, ChecksumMode};
pub use engine::TransportCredentials;
pub use server::FileServer;
pub use transport::{ClientOptions, DownloadReport, FileClient};
pub use types::{LoadRequest, LoadResponse};
