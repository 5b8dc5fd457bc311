//! Settings propagated from the supervisor to workers and transports.

use std::time::Duration;

use quicgate_proto::StatelessResetSecret;

/// Knobs shared by every connection a server accepts.
///
/// The server core reads only the reset secret; the rest is carried opaquely
/// to the external transport.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Key for generating and recognizing stateless reset tokens. Must match
    /// across every process that may answer for a connection, or takeover
    /// breaks resets. Read-only after construction.
    pub stateless_reset_secret: StatelessResetSecret,
    /// Idle timeout advertised to peers.
    pub idle_timeout: Duration,
    /// Largest UDP payload this server will emit.
    pub max_send_packet_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            stateless_reset_secret: StatelessResetSecret::random(),
            idle_timeout: Duration::from_secs(60),
            max_send_packet_size: quicgate_proto::DEFAULT_UDP_SEND_PACKET_LEN,
        }
    }
}
