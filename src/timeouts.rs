//! Centralized connection and shutdown timing for the TCP mesh.
//!
//! Protocol calls themselves block without deadlines; only mesh setup and teardown are
//! bounded here.

use std::time::Duration;

/// Attempts made to reach a lower-ranked peer while the mesh forms.
pub const MESH_CONNECT_ATTEMPTS: usize = 40;
/// First backoff step between connect attempts.
pub const MESH_CONNECT_BACKOFF: Duration = Duration::from_millis(25);
/// Ceiling for a single backoff step.
pub const MESH_CONNECT_MAX_BACKOFF: Duration = Duration::from_secs(1);
/// Time allowed for higher-ranked peers to dial in.
pub const MESH_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval of the non-blocking accept loop.
pub const MESH_ACCEPT_POLL: Duration = Duration::from_millis(10);
/// Grace period for reader threads to exit once their socket is shut down.
pub const MESH_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
