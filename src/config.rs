use crate::crypto::Crypto;
use crate::frame::Frame;
use crate::packet::PacketHeader;
use crate::scheduler::Scheduler;
use anyhow::bail;
use std::sync::Arc;
use std::time::Duration;

/// How queued sends are combined into packets
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CoalescingMode {
    /// every send goes into a packet of its own, and it is sent immediately
    None,
    /// sends are combined into packets as whole frames, and packets are sent after the
    ///  coalescing delay
    Packet,
    /// payloads are treated as a byte stream, filling packets completely and fragmenting sends
    ///  across packets as needed. Message boundaries are *not* preserved.
    Stream,
}

/// Per-connection options. Fields that are `None` are inherited from the socket's defaults.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ConnectionOptions {
    pub reliable_coalescing: Option<CoalescingMode>,
    pub reliable_coalesce_delay: Option<Duration>,
    pub unreliable_coalescing: Option<CoalescingMode>,
    pub unreliable_coalesce_delay: Option<Duration>,

    /// A probe is sent after a connection was idle for this interval. This should be small
    ///  enough for a probe to be sent before the last retry of an in-flight packet would expire.
    pub probe_interval: Option<Duration>,
    /// number of retransmissions of a reliable packet before the connection is declared dead
    pub max_attempts: Option<u32>,
}

impl ConnectionOptions {
    pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;
    /// probes can not fire more often than the scheduler ticks
    pub const MIN_PROBE_INTERVAL: Duration = Scheduler::TICK;

    /// field-wise merge: values set here take precedence over `defaults`
    pub fn merge(&self, defaults: &ConnectionOptions) -> ConnectionOptions {
        ConnectionOptions {
            reliable_coalescing: self.reliable_coalescing.or(defaults.reliable_coalescing),
            reliable_coalesce_delay: self.reliable_coalesce_delay.or(defaults.reliable_coalesce_delay),
            unreliable_coalescing: self.unreliable_coalescing.or(defaults.unreliable_coalescing),
            unreliable_coalesce_delay: self.unreliable_coalesce_delay.or(defaults.unreliable_coalesce_delay),
            probe_interval: self.probe_interval.or(defaults.probe_interval),
            max_attempts: self.max_attempts.or(defaults.max_attempts),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(probe_interval) = self.probe_interval {
            if probe_interval < Self::MIN_PROBE_INTERVAL {
                bail!("probe interval {:?} is below the minimum of {:?}", probe_interval, Self::MIN_PROBE_INTERVAL);
            }
        }
        if self.max_attempts == Some(0) {
            bail!("max attempts must be positive");
        }
        Ok(())
    }
}

/// The options a connection actually works with, after merging and negotiation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EffectiveConnectionConfig {
    pub reliable_coalescing: CoalescingMode,
    pub reliable_coalesce_delay: Duration,
    pub unreliable_coalescing: CoalescingMode,
    pub unreliable_coalesce_delay: Duration,
    pub probe_interval: Duration,
    pub max_attempts: u32,
}

impl From<ConnectionOptions> for EffectiveConnectionConfig {
    fn from(value: ConnectionOptions) -> Self {
        EffectiveConnectionConfig {
            reliable_coalescing: value.reliable_coalescing.unwrap_or(CoalescingMode::None),
            reliable_coalesce_delay: value.reliable_coalesce_delay.unwrap_or(Duration::ZERO),
            unreliable_coalescing: value.unreliable_coalescing.unwrap_or(CoalescingMode::None),
            unreliable_coalesce_delay: value.unreliable_coalesce_delay.unwrap_or(Duration::ZERO),
            probe_interval: value.probe_interval.unwrap_or(ConnectionOptions::DEFAULT_PROBE_INTERVAL),
            max_attempts: value.max_attempts.unwrap_or(ConnectionOptions::DEFAULT_MAX_ATTEMPTS),
        }
    }
}

#[derive(Clone)]
pub struct SocketConfig {
    /// The maximum size of a UDP payload. Packets are never fragmented, so this must be supported
    ///  on all routes between peers.
    pub max_datagram_size: usize,

    pub initial_window: u32,
    pub max_window: u32,

    pub initial_rtt: Duration,
    /// upper bound for the RTT estimate, which failed transmissions push the estimate towards
    pub max_rtt: Duration,
    /// added to 2x RTT for the retry delay, covering the time a peer may delay an ack
    pub delayed_ack_allowance: Duration,
    /// time for which acks are collected before they are sent. Zero means acks are sent
    ///  immediately.
    pub ack_delay: Duration,
    /// a closed connection is kept around for this many RTTs to handle packets that are still
    ///  in flight
    pub close_grace_rtt_factor: u32,

    pub default_options: ConnectionOptions,

    pub crypto: Option<Arc<dyn Crypto>>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            max_datagram_size: 1500,
            initial_window: 8,
            max_window: 128,
            initial_rtt: Duration::from_millis(100),
            max_rtt: Duration::from_secs(2),
            delayed_ack_allowance: Duration::from_millis(20),
            ack_delay: Duration::ZERO,
            close_grace_rtt_factor: 3,
            default_options: ConnectionOptions {
                reliable_coalescing: Some(CoalescingMode::None),
                reliable_coalesce_delay: Some(Duration::ZERO),
                unreliable_coalescing: Some(CoalescingMode::None),
                unreliable_coalesce_delay: Some(Duration::ZERO),
                probe_interval: Some(ConnectionOptions::DEFAULT_PROBE_INTERVAL),
                max_attempts: Some(ConnectionOptions::DEFAULT_MAX_ATTEMPTS),
            },
            crypto: None,
        }
    }
}

impl SocketConfig {
    pub const MIN_DATAGRAM_SIZE: usize = 256;
    /// In-flight ids must stay far below half the 16-bit id space for wraparound comparison to
    ///  work
    pub const MAX_WINDOW_LIMIT: u32 = 1 << 14;

    const LONG_ID_LEN: usize = size_of::<u128>();

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < Self::MIN_DATAGRAM_SIZE {
            bail!("max datagram size {} is too small, minimum is {}", self.max_datagram_size, Self::MIN_DATAGRAM_SIZE);
        }
        if self.max_datagram_size > u16::MAX as usize {
            bail!("max datagram size {} exceeds UDP limits", self.max_datagram_size);
        }
        if self.initial_window == 0 || self.max_window == 0 {
            bail!("window sizes must be positive");
        }
        if self.initial_window > self.max_window {
            bail!("initial window {} is bigger than max window {}", self.initial_window, self.max_window);
        }
        if self.max_window > Self::MAX_WINDOW_LIMIT {
            bail!("max window {} exceeds the limit of {}", self.max_window, Self::MAX_WINDOW_LIMIT);
        }
        if self.initial_rtt.is_zero() || self.initial_rtt > self.max_rtt {
            bail!("initial RTT must be positive and not exceed max RTT");
        }
        if self.close_grace_rtt_factor == 0 {
            bail!("close grace factor must be positive");
        }
        self.default_options.validate()?;
        Ok(())
    }

    /// maximum payload of a packet, i.e. what is left of a datagram after header, routing
    ///  prefix and crypto overhead
    pub fn max_packet_payload(&self) -> usize {
        let crypto_overhead = self.crypto.as_ref()
            .map(|c| c.overhead())
            .unwrap_or(0);

        self.max_datagram_size
            - PacketHeader::SERIALIZED_LEN
            - Self::LONG_ID_LEN
            - crypto_overhead
    }

    /// maximum size of a single send unless stream coalescing is active
    pub fn max_frame_payload(&self) -> usize {
        self.max_packet_payload() - Frame::HEADER_LEN
    }

    pub fn effective_connection_config(&self, options: &ConnectionOptions) -> EffectiveConnectionConfig {
        options.merge(&self.default_options).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = SocketConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_packet_payload(), 1500 - 6 - 16);
        assert_eq!(config.max_frame_payload(), 1500 - 6 - 16 - 5);
    }

    #[rstest]
    #[case::datagram_too_small(|c: &mut SocketConfig| c.max_datagram_size = 100)]
    #[case::zero_window(|c: &mut SocketConfig| c.initial_window = 0)]
    #[case::initial_above_max_window(|c: &mut SocketConfig| c.initial_window = 200)]
    #[case::window_too_big(|c: &mut SocketConfig| { c.initial_window = 1; c.max_window = 1 << 15 })]
    #[case::zero_rtt(|c: &mut SocketConfig| c.initial_rtt = Duration::ZERO)]
    #[case::zero_grace(|c: &mut SocketConfig| c.close_grace_rtt_factor = 0)]
    #[case::zero_probe_interval(|c: &mut SocketConfig| c.default_options.probe_interval = Some(Duration::ZERO))]
    #[case::probe_interval_below_tick(|c: &mut SocketConfig| c.default_options.probe_interval = Some(Duration::from_millis(9)))]
    #[case::zero_max_attempts(|c: &mut SocketConfig| c.default_options.max_attempts = Some(0))]
    fn test_validate_rejects(#[case] modify: fn(&mut SocketConfig)) {
        let mut config = SocketConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_is_field_wise() {
        let defaults = SocketConfig::default().default_options;
        let options = ConnectionOptions {
            reliable_coalescing: Some(CoalescingMode::Stream),
            probe_interval: Some(Duration::from_secs(1)),
            ..Default::default()
        };

        let effective = SocketConfig::default().effective_connection_config(&options);
        assert_eq!(effective, EffectiveConnectionConfig {
            reliable_coalescing: CoalescingMode::Stream,
            reliable_coalesce_delay: Duration::ZERO,
            unreliable_coalescing: CoalescingMode::None,
            unreliable_coalesce_delay: Duration::ZERO,
            probe_interval: Duration::from_secs(1),
            max_attempts: defaults.max_attempts.unwrap(),
        });
    }

    #[test]
    fn test_unset_defaults_fall_back_to_constants() {
        let effective: EffectiveConnectionConfig = ConnectionOptions::default().into();
        assert_eq!(effective.probe_interval, ConnectionOptions::DEFAULT_PROBE_INTERVAL);
        assert_eq!(effective.max_attempts, ConnectionOptions::DEFAULT_MAX_ATTEMPTS);
        assert_eq!(effective.reliable_coalescing, CoalescingMode::None);
    }
}
