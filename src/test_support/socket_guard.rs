//! Skips wiremock-backed tests when localhost sockets cannot be bound.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

/// Whether socket-bound tests must fail instead of being skipped.
#[must_use]
pub fn socket_tests_required() -> bool {
    std::env::var("DEVFLOW_REQUIRE_SOCKET_TESTS")
        .ok()
        .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Returns `true` (and logs why) when no localhost socket can be bound.
#[track_caller]
#[must_use]
pub fn should_skip_socket_bound_test() -> bool {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return false;
    }

    let location = Location::caller();
    let message = format!(
        "[socket-bound-test] cannot bind localhost socket at {}:{}",
        location.file(),
        location.line()
    );
    assert!(
        !socket_tests_required(),
        "{message}. Set DEVFLOW_REQUIRE_SOCKET_TESTS=0 to allow skipping."
    );

    eprintln!("{message}. Skipping test.");
    true
}

/// Starts a mock server, or returns `None` when sockets are unavailable.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if should_skip_socket_bound_test() {
        None
    } else {
        Some(MockServer::start().await)
    }
}
