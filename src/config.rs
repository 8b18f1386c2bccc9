//! Endpoint-owned configuration.
//!
//! Per the design note against process-wide mutable singletons, an
//! `EndpointConfig` is built once and passed by reference at endpoint
//! construction; nothing in this crate reaches for a global. Every field here
//! corresponds to one row of the recognized configuration options table.

use std::time::Duration;

use crate::error::ConfigError;

pub const MAX_SRC_ADDR_LEN: usize = 32;
pub const SGL_LIMIT: usize = 4;
pub const PROTOCOL_VERSION_MAJOR: u8 = 2;
pub const PROTOCOL_VERSION_MINOR: u8 = 0;
pub const MAX_MTU_BOUND: usize = 1 << 15;

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub rx_window_size: u16,
    pub tx_min_credits: u16,
    pub tx_max_credits: u16,
    pub recvwin_size: u32,
    pub cq_size: usize,
    pub max_timeout: Duration,
    pub timeout_interval_range: (Duration, Duration),
    pub efa_cq_read_size: usize,
    pub shm_cq_read_size: usize,
    pub enable_sas_ordering: bool,
    pub enable_shm_transfer: bool,
    pub mtu_size: usize,
    pub max_memcpy_size: usize,
    pub tx_iov_limit: usize,
    pub rx_iov_limit: usize,
    pub efa_max_emulated_read_size: usize,
    pub efa_max_emulated_write_size: usize,
    pub efa_read_segment_size: usize,
    /// This endpoint's own address, piggybacked on RTS headers until the
    /// peer's CM state reaches ACKED (§4.2, §6).
    pub local_addr: [u8; MAX_SRC_ADDR_LEN],
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            rx_window_size: 128,
            tx_min_credits: 32,
            tx_max_credits: 64,
            recvwin_size: 16_384,
            cq_size: 8_192,
            max_timeout: Duration::from_micros(1_000_000),
            timeout_interval_range: (Duration::from_micros(40), Duration::from_micros(120)),
            efa_cq_read_size: 50,
            shm_cq_read_size: 50,
            enable_sas_ordering: true,
            enable_shm_transfer: true,
            mtu_size: 8_928,
            max_memcpy_size: 4_096,
            tx_iov_limit: SGL_LIMIT,
            rx_iov_limit: SGL_LIMIT,
            efa_max_emulated_read_size: 1 << 20,
            efa_max_emulated_write_size: 1 << 20,
            efa_read_segment_size: 1 << 18,
            local_addr: [0u8; MAX_SRC_ADDR_LEN],
        }
    }
}

impl EndpointConfig {
    pub fn builder() -> EndpointConfigBuilder {
        EndpointConfigBuilder {
            inner: EndpointConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tx_min_credits > self.tx_max_credits {
            return Err(ConfigError::CreditBoundsInverted {
                min: self.tx_min_credits,
                max: self.tx_max_credits,
            });
        }
        if self.mtu_size == 0 || self.mtu_size > MAX_MTU_BOUND {
            return Err(ConfigError::InvalidMtu(self.mtu_size));
        }
        if self.recvwin_size == 0 {
            return Err(ConfigError::ZeroRecvWindow);
        }
        if self.tx_iov_limit == 0 || self.tx_iov_limit > SGL_LIMIT {
            return Err(ConfigError::InvalidIovLimit(self.tx_iov_limit));
        }
        if self.rx_iov_limit == 0 || self.rx_iov_limit > SGL_LIMIT {
            return Err(ConfigError::InvalidIovLimit(self.rx_iov_limit));
        }
        Ok(())
    }
}

/// Validated setters over an `EndpointConfig` in progress; `build()` runs the
/// cross-field checks once at the end rather than on every setter call.
#[derive(Debug, Clone)]
pub struct EndpointConfigBuilder {
    inner: EndpointConfig,
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.inner.$name = value;
            self
        }
    };
}

impl EndpointConfigBuilder {
    setter!(rx_window_size, u16);
    setter!(tx_min_credits, u16);
    setter!(tx_max_credits, u16);
    setter!(recvwin_size, u32);
    setter!(cq_size, usize);
    setter!(max_timeout, Duration);
    setter!(efa_cq_read_size, usize);
    setter!(shm_cq_read_size, usize);
    setter!(enable_sas_ordering, bool);
    setter!(enable_shm_transfer, bool);
    setter!(mtu_size, usize);
    setter!(max_memcpy_size, usize);
    setter!(tx_iov_limit, usize);
    setter!(rx_iov_limit, usize);
    setter!(efa_max_emulated_read_size, usize);
    setter!(efa_max_emulated_write_size, usize);
    setter!(efa_read_segment_size, usize);
    setter!(local_addr, [u8; MAX_SRC_ADDR_LEN]);

    pub fn timeout_interval_range(mut self, lo: Duration, hi: Duration) -> Self {
        self.inner.timeout_interval_range = (lo, hi);
        self
    }

    pub fn build(self) -> Result<EndpointConfig, ConfigError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EndpointConfig::default().validate().unwrap();
    }

    #[test]
    fn inverted_credit_bounds_rejected() {
        let err = EndpointConfig::builder()
            .tx_min_credits(64)
            .tx_max_credits(32)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::CreditBoundsInverted { min: 64, max: 32 }
        );
    }

    #[test]
    fn zero_mtu_rejected() {
        let err = EndpointConfig::builder().mtu_size(0).build().unwrap_err();
        assert_eq!(err, ConfigError::InvalidMtu(0));
    }

    #[test]
    fn zero_recv_window_rejected() {
        let err = EndpointConfig::builder()
            .recvwin_size(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroRecvWindow);
    }
}
