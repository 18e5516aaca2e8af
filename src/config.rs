//! Server/client configuration structs (§6) plus the handful of protocol
//! constants §5/§9 leave to the implementer.

use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default `MulticastBurstLength` (§9 Open Questions: "pick an empirically
/// reasonable value and expose it as config").
pub const DEFAULT_BURST_LENGTH: usize = 64;

/// Default control-channel read timeout (§5).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Nominal cadence of `PacketStatusUpdate` from a receiver (§4.4).
pub const DEFAULT_PACKET_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Delay before a receiver re-attempts after a non-fatal error (§5).
pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// `WaveBoundaryTimeout = max(ReadTimeout, 2 * PacketUpdateInterval)` (§5).
pub fn wave_boundary_timeout(read_timeout: Duration, packet_update_interval: Duration) -> Duration {
    read_timeout.max(packet_update_interval * 2)
}

/// Server-side configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path MTU used to derive `block_size` (§4.5).
    pub mtu: usize,
    /// Whether the multicast group address is IPv6 (`ff00::/8`) rather than
    /// IPv4 class-D.
    pub ipv6: bool,
    /// Maximum admitted receivers per session.
    pub max_connections_per_session: usize,
    /// Maximum concurrently live sessions.
    pub max_sessions: usize,
    /// Base multicast group address; `session_id` does not change the
    /// address in this implementation, only the port (see
    /// `multicast_start_port`).
    pub multicast_address: Ipv4Addr,
    /// `multicast_port = multicast_start_port + session_id`.
    pub multicast_start_port: u16,
    /// Max datagrams enqueued to the transport before yielding (§4.3 step 2).
    pub multicast_burst_length: usize,
    /// Root directory under which payload paths are resolved by the
    /// `FileSet` collaborator.
    pub root_folder: std::path::PathBuf,
    /// Optional bind interface name; `None` uses the OS default.
    pub interface_name: Option<String>,
    /// Multicast TTL (default 1, i.e. link-local).
    pub ttl: u32,
    /// Optional pre-shared key pass-phrase. `None` disables both the
    /// payload encoder and the `SecureChannel` PSK wrapping.
    pub pass_phrase: Option<String>,
    pub read_timeout: Duration,
    pub packet_update_interval: Duration,
    /// Grace period a session is kept alive with zero admitted receivers
    /// before it is torn down (§3 "Session" lifecycle).
    pub idle_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            ipv6: false,
            max_connections_per_session: 32,
            max_sessions: 16,
            multicast_address: Ipv4Addr::new(239, 0, 0, 1),
            multicast_start_port: 9000,
            multicast_burst_length: DEFAULT_BURST_LENGTH,
            root_folder: std::path::PathBuf::from("."),
            interface_name: None,
            ttl: 1,
            pass_phrase: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            packet_update_interval: DEFAULT_PACKET_UPDATE_INTERVAL,
            idle_grace: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn wave_boundary_timeout(&self) -> Duration {
        wave_boundary_timeout(self.read_timeout, self.packet_update_interval)
    }

    /// Construct from a JSON document (§1 ambient configuration: "no CLI
    /// flag parsing ... constructible in code or from JSON").
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Character encoding used to turn a pass-phrase into key-derivation bytes
/// (§6 "PSK derivation"). Default is UTF-16LE for compatibility with the
/// source system; an alternative is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassphraseEncoding {
    Utf16Le,
    Utf8,
}

impl Default for PassphraseEncoding {
    fn default() -> Self {
        PassphraseEncoding::Utf16Le
    }
}

impl PassphraseEncoding {
    /// Encode a pass-phrase to the byte sequence fed into the key schedule.
    pub fn encode(&self, pass_phrase: &str) -> Vec<u8> {
        match self {
            PassphraseEncoding::Utf16Le => {
                let mut out = Vec::with_capacity(pass_phrase.len() * 2);
                for unit in pass_phrase.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                out
            }
            PassphraseEncoding::Utf8 => pass_phrase.as_bytes().to_vec(),
        }
    }
}

/// Client-side configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Optional encoder pass-phrase + charset; `None` disables payload
    /// decoding (server must also be unencoded, or frames are discarded).
    pub pass_phrase: Option<String>,
    pub passphrase_encoding: PassphraseEncoding,
    /// Receive buffer size for the multicast socket.
    pub multicast_buffer_size: usize,
    pub read_timeout: Duration,
    pub ttl: u32,
    pub root_folder: std::path::PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pass_phrase: None,
            passphrase_encoding: PassphraseEncoding::Utf16Le,
            multicast_buffer_size: 1 << 20,
            read_timeout: DEFAULT_READ_TIMEOUT,
            ttl: 1,
            root_folder: std::path::PathBuf::from("."),
        }
    }
}

impl ClientConfig {
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Bind to port 0 and return the OS-assigned free port. Used by tests to
/// pick an ephemeral control-channel port without races.
pub fn pick_free_port() -> std::io::Result<u16> {
    let sock = TcpListener::bind(("127.0.0.1", 0))?;
    let port = sock.local_addr()?.port();
    drop(sock);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_json_roundtrip() {
        let mut cfg = ServerConfig::default();
        cfg.pass_phrase = Some("foo123".into());
        cfg.multicast_start_port = 9100;
        let json = cfg.to_json().unwrap();
        let restored = ServerConfig::from_json(&json).unwrap();
        assert_eq!(restored.pass_phrase, cfg.pass_phrase);
        assert_eq!(restored.multicast_start_port, cfg.multicast_start_port);
        assert_eq!(restored.ipv6, cfg.ipv6);
    }

    #[test]
    fn client_config_json_roundtrip() {
        let mut cfg = ClientConfig::default();
        cfg.pass_phrase = Some("s3cr3t".into());
        cfg.passphrase_encoding = PassphraseEncoding::Utf8;
        let json = cfg.to_json().unwrap();
        let restored = ClientConfig::from_json(&json).unwrap();
        assert_eq!(restored.pass_phrase, cfg.pass_phrase);
        assert_eq!(restored.passphrase_encoding, cfg.passphrase_encoding);
    }

    #[test]
    fn wave_boundary_timeout_takes_the_larger_bound() {
        let timeout = wave_boundary_timeout(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(timeout, Duration::from_secs(20));
        let timeout = wave_boundary_timeout(Duration::from_secs(600), Duration::from_secs(1));
        assert_eq!(timeout, Duration::from_secs(600));
    }
}
