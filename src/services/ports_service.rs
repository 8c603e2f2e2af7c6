use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::error::IdeError;

/// Picks host ports for new containers by probing bind availability in a
/// fixed high range. The probe listener is released immediately, so a narrow
/// race against the runtime's own binding remains; the runtime's
/// port-already-in-use failure at creation time covers it.
pub struct PortAllocator {
    min: u16,
    max: u16,
    max_attempts: u32,
    rng: Mutex<StdRng>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self::with_rng(min, max, StdRng::from_entropy())
    }

    /// Seeded variant so allocation is deterministic under test.
    pub fn with_rng(min: u16, max: u16, rng: StdRng) -> Self {
        let span = max.saturating_sub(min).max(1) as u32;
        PortAllocator {
            min,
            max,
            // bounded rather than looping forever under port exhaustion
            max_attempts: span * 4,
            rng: Mutex::new(rng),
        }
    }

    pub async fn allocate(&self) -> Result<u16, IdeError> {
        for _ in 0..self.max_attempts {
            let candidate = self.rng.lock().await.gen_range(self.min..self.max);
            if Self::probe(candidate).await {
                return Ok(candidate);
            }
        }
        Err(IdeError::Internal(format!(
            "no bindable port found in {}..{}",
            self.min, self.max
        )))
    }

    /// Whether the exact port can currently be bound locally.
    pub async fn probe(port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).await.is_ok()
    }
}
