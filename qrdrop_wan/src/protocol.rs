use std::time::Duration;

/// ALPN protocol identifier for qrdrop
pub const ALPN: &[u8] = b"qrdrop/1";

/// How long an accepted connection has to open its stream and send the
/// preamble
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a local close waits for the peer to drain the stream before the
/// connection is torn down
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Interval between connection type / RTT reports
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(3);
