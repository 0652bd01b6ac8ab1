use super::FetchError;

/// Rate-based fault injection for the in-process service.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultProfile {
    pub transport_rate: f64,
    pub malformed_rate: f64,
}

impl FaultProfile {
    pub fn disabled() -> Self {
        Self {
            transport_rate: 0.0,
            malformed_rate: 0.0,
        }
    }

    pub fn from_env() -> Self {
        Self {
            transport_rate: std::env::var("STUB_TRANSPORT_FAULT_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            malformed_rate: std::env::var("STUB_MALFORMED_FAULT_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
        }
    }

    /// Deterministic fault decision for the `seq`-th call.
    pub fn pick(&self, seq: u64) -> Option<FetchError> {
        // Spread consecutive call numbers over the unit interval.
        let seed = seq.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 11;
        if should_fault(seed, self.transport_rate) {
            return Some(FetchError::Transport {
                status: Some(503),
                message: "injected transport fault".to_string(),
            });
        }
        if should_fault(seed / 10_000, self.malformed_rate) {
            return Some(FetchError::Malformed("injected malformed payload".to_string()));
        }
        None
    }
}

pub fn should_fault(seed: u64, rate: f64) -> bool {
    let v = (seed % 10_000) as f64 / 10_000.0;
    v < rate
}
