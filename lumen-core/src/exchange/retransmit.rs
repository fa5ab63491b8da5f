use rand::RngCore;
use std::time::{Duration, Instant};

/// RFC 7252 section 4.8 transmission parameters (defaults).
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);
pub const ACK_RANDOM_FACTOR: f64 = 1.5;
pub const MAX_RETRANSMIT: u32 = 4;
pub const MAX_LATENCY: Duration = Duration::from_secs(100);
pub const PROCESSING_DELAY: Duration = Duration::from_secs(2);

/// Derived defaults: how long a confirmable exchange can possibly take.
pub const MAX_TRANSMIT_WAIT: Duration = Duration::from_secs(93);
pub const MAX_EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

/// Tunable CoAP transmission parameters for one session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoapTxParams {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
}

impl Default for CoapTxParams {
    fn default() -> Self {
        CoapTxParams {
            ack_timeout: ACK_TIMEOUT,
            ack_random_factor: ACK_RANDOM_FACTOR,
            max_retransmit: MAX_RETRANSMIT,
        }
    }
}

impl CoapTxParams {
    /// `MAX_TRANSMIT_SPAN`: first transmission to last retransmission.
    pub fn max_transmit_span(&self) -> Duration {
        let factor = (1u32 << self.max_retransmit) - 1;
        self.ack_timeout
            .mul_f64(f64::from(factor) * self.ack_random_factor)
    }

    /// `MAX_TRANSMIT_WAIT`: first transmission to giving up entirely.
    pub fn max_transmit_wait(&self) -> Duration {
        let factor = (1u32 << (self.max_retransmit + 1)) - 1;
        self.ack_timeout
            .mul_f64(f64::from(factor) * self.ack_random_factor)
    }

    /// `EXCHANGE_LIFETIME`: the replay/caching horizon of one exchange.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + 2 * MAX_LATENCY + PROCESSING_DELAY
    }

    /// Draws the initial ACK timeout uniformly from
    /// `[ack_timeout, ack_timeout * ack_random_factor]`.
    pub fn initial_timeout(&self, rng: &mut dyn RngCore) -> Duration {
        let spread = self.ack_random_factor - 1.0;
        if spread <= 0.0 {
            return self.ack_timeout;
        }
        let unit = f64::from(rng.next_u32()) / f64::from(u32::MAX);
        self.ack_timeout.mul_f64(1.0 + spread * unit)
    }
}

/// Retransmission bookkeeping for one confirmable transmission.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    initial: Duration,
    retries: u32,
    deadline: Instant,
}

impl RetryState {
    pub fn start(params: &CoapTxParams, rng: &mut dyn RngCore, now: Instant) -> RetryState {
        let initial = params.initial_timeout(rng);
        RetryState {
            initial,
            retries: 0,
            deadline: now + initial,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Advances to the next binary-backoff deadline after an expiry.
    /// Returns `false` once the retransmission budget is exhausted.
    pub fn backoff(&mut self, params: &CoapTxParams, now: Instant) -> bool {
        if self.retries >= params.max_retransmit {
            return false;
        }
        self.retries += 1;
        self.deadline = now + self.initial * (1 << self.retries);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn derived_parameters_match_rfc() {
        let params = CoapTxParams::default();
        assert_eq!(params.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(params.max_transmit_wait(), Duration::from_secs(93));
        assert_eq!(params.exchange_lifetime(), Duration::from_secs(247));
    }

    #[test]
    fn initial_timeout_within_bounds() {
        let params = CoapTxParams::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let timeout = params.initial_timeout(&mut rng);
            assert!(timeout >= params.ack_timeout);
            assert!(timeout <= params.ack_timeout.mul_f64(params.ack_random_factor));
        }
    }

    #[test]
    fn backoff_doubles_and_exhausts() {
        let params = CoapTxParams {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.0,
            max_retransmit: 2,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let start = Instant::now();
        let mut retry = RetryState::start(&params, &mut rng, start);
        assert_eq!(retry.deadline() - start, Duration::from_secs(2));

        assert!(retry.backoff(&params, start + Duration::from_secs(2)));
        assert_eq!(retry.deadline() - start, Duration::from_secs(6));

        assert!(retry.backoff(&params, start + Duration::from_secs(6)));
        assert_eq!(retry.deadline() - start, Duration::from_secs(14));

        assert!(!retry.backoff(&params, start + Duration::from_secs(14)));
    }
}
