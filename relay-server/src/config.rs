//! CLI surface. Named a collaborator by the spec but deliberately kept out
//! of the core event pipeline — this module only ever produces a plain
//! [`Args`] struct that `main` hands down to the listeners.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "relay-server",
    about = "Lockstep broadcast relay for multiplayer game sessions"
)]
pub struct Args {
    /// Port for line-delimited JSON over raw TCP.
    #[arg(long, default_value_t = 9121)]
    pub tcp_port: u16,

    /// Port for JSON-over-WebSocket upgrades.
    #[arg(long, default_value_t = 9122)]
    pub ws_port: u16,

    /// Auxiliary line-echo port; not part of the relay protocol.
    #[arg(long, default_value_t = 9120)]
    pub echo_port: u16,

    /// A player session with no traffic for this long is force-closed.
    #[arg(long, default_value_t = 30_000)]
    pub idle_timeout_ms: u64,

    /// How often the idle watchdog checks each connection.
    #[arg(long, default_value_t = 1_000)]
    pub watchdog_interval_ms: u64,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            tcp_port: 9121,
            ws_port: 9122,
            echo_port: 9120,
            idle_timeout_ms: 30_000,
            watchdog_interval_ms: 1_000,
        }
    }
}
