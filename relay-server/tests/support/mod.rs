//! Shared test harness: boots a real server on fixed-but-test-local ports
//! and polls until it accepts connections, the same shape as driving the
//! server from an actual client rather than calling its internals.

use std::time::Duration;

use relay_server::config::Args;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub struct RunningServer {
    pub tcp_port: u16,
    pub ws_port: u16,
}

/// Spawns `relay_server::run` with the given ports on the current runtime
/// and waits until its TCP listener is accepting connections.
pub async fn start(tcp_port: u16, ws_port: u16, echo_port: u16) -> RunningServer {
    start_with_timeouts(tcp_port, ws_port, echo_port, 30_000, 1_000).await
}

/// Like [`start`] but with a configurable idle timeout / watchdog interval,
/// for tests that exercise spec §7's idle-disconnect path without waiting
/// out the real 30s default.
pub async fn start_with_timeouts(
    tcp_port: u16,
    ws_port: u16,
    echo_port: u16,
    idle_timeout_ms: u64,
    watchdog_interval_ms: u64,
) -> RunningServer {
    let args = Args {
        tcp_port,
        ws_port,
        echo_port,
        idle_timeout_ms,
        watchdog_interval_ms,
    };
    tokio::spawn(async move {
        if let Err(err) = relay_server::run(args).await {
            panic!("test server failed to start: {err}");
        }
    });

    timeout(Duration::from_secs(5), wait_for_port(tcp_port))
        .await
        .expect("server did not come up in time");

    RunningServer { tcp_port, ws_port }
}

async fn wait_for_port(port: u16) {
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
