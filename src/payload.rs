use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Size of the shared buffer file contents are streamed from.
/// 1 MiB balances memory footprint against per-write granularity.
pub const PAYLOAD_SIZE: usize = 1 << 20;

static PAYLOAD: OnceLock<Bytes> = OnceLock::new();

/// Process-wide buffer of pseudo-random bytes used as the body source for
/// every response. Filled once on first use, never mutated afterwards, so
/// any number of concurrent handlers can slice it without synchronization.
pub fn payload() -> &'static Bytes {
    PAYLOAD.get_or_init(|| {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut buf = vec![0u8; PAYLOAD_SIZE];
        rng.fill_bytes(&mut buf);
        Bytes::from(buf)
    })
}
