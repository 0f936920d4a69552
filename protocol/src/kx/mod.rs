//! Key exchange variants. A running process is pinned to exactly one at build/config
//! time; the two never interoperate and a handshake never negotiates between them.

pub mod pq;
pub mod sigma;

use serde::{Deserialize, Serialize};

/// Which handshake a `Session` speaks. Chosen once, out of band, never advertised or
/// negotiated on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variant {
    /// Variant A: SIGMA-style X25519 station-to-station.
    Sigma,
    /// Variant B: four-way ML-KEM-768 encapsulation, the default.
    PostQuantum,
}

impl Default for Variant {
    fn default() -> Self {
        Variant::PostQuantum
    }
}
