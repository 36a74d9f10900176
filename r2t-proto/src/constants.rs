//! Values shared by both peers (spec.md §6).

use std::time::Duration;

/// Default virtual channel name (`r2tsrv [channel-name]`).
pub const DEFAULT_CHANNEL_NAME: &str = "rdp2tcp";

/// Default controller bind address (`r2tcli [bind-host [bind-port]]`).
pub const DEFAULT_CONTROLLER_HOST: &str = "127.0.0.1";
pub const DEFAULT_CONTROLLER_PORT: u16 = 8477;

/// Ping heartbeat interval. The server pings every `PING_DELAY - 1s`; the client considers the
/// channel dead after `PING_DELAY + 4s` of silence.
pub const PING_DELAY: Duration = Duration::from_secs(5);

/// Tunnel id space is `0..=254`; `255` is the reserved "none" sentinel.
pub const MAX_TUNNEL_ID: u8 = 254;
