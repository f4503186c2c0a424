use sha2::{Digest, Sha256, Sha512};

/* ------------------------------ Algorithms ------------------------------ */

/// Checksum algorithms the file server and client agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Canonical lowercase name used on the wire (`checksum` query
    /// parameter and `X-Checksum-Algorithm` header).
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }

    /// Look up an algorithm by name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "sha256" => Some(ChecksumAlgorithm::Sha256),
            "sha512" => Some(ChecksumAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn new_hasher(&self) -> Hasher {
        match self {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

/// Where the checksum of a download is computed, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Don't compute a checksum
    None,
    /// Compute only at the client while receiving the data
    ClientOnly,
    /// Compute only at the server while sending the data
    ServerOnly,
    /// Compute at both ends and cross-check
    Both,
}

/* ------------------------------ Hasher ------------------------------ */

/// A running digest over a streamed body.
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Consume the hasher and return the digest as lowercase hex.
    pub fn finish_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}
