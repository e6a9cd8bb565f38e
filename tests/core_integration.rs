//! Integration tests against `SshCore` using mock collaborators. These
//! exercise the composition wiring, policy-refusal paths, and observability
//! surfaces that don't require a live SSH peer (scenarios 1, 3, and 6 from
//! the design's concrete-scenario list). Scenarios needing a real handshake
//! (2, 4, 5) would need an in-process SSH server and are out of scope for
//! this crate's own test suite; they're marked `#[ignore]` below with a
//! note on what harness they'd need.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use fleet_sshcore::collaborators::{InstanceLister, Orchestrator};
use fleet_sshcore::error::ConnectError;
use fleet_sshcore::events::{ConnectionEvent, EventListener};
use fleet_sshcore::state::ConnectionState;
use fleet_sshcore::{InstanceId, SshCore};

struct MockOrchestrator {
    address: (String, u16),
    address_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    fail_address: bool,
    fail_upload: bool,
}

impl MockOrchestrator {
    fn reachable(host: &str, port: u16) -> Self {
        MockOrchestrator {
            address: (host.to_string(), port),
            address_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            fail_address: false,
            fail_upload: false,
        }
    }

    fn address_failing() -> Self {
        MockOrchestrator {
            address: (String::new(), 0),
            address_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            fail_address: true,
            fail_upload: false,
        }
    }

    fn upload_failing(host: &str, port: u16) -> Self {
        MockOrchestrator {
            address: (host.to_string(), port),
            address_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            fail_address: false,
            fail_upload: true,
        }
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn get_ssh_address(&self, _instance_id: InstanceId) -> Result<(String, u16), String> {
        self.address_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_address {
            Err("no such instance".to_string())
        } else {
            Ok(self.address.clone())
        }
    }

    async fn configure_ssh_access(&self, _instance_id: InstanceId, _public_key_text: &str) -> Result<(), String> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_upload {
            Err("agent rejected key upload".to_string())
        } else {
            Ok(())
        }
    }
}

struct MockLister(Vec<InstanceId>);

#[async_trait]
impl InstanceLister for MockLister {
    async fn list_running(&self) -> Result<Vec<InstanceId>, String> {
        Ok(self.0.clone())
    }
}

struct CountingListener(Arc<AtomicUsize>);

impl EventListener for CountingListener {
    fn on_event(&self, _event: &ConnectionEvent) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn temp_key_dir(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("sshcore-it-{label}-{}", std::process::id()))
}

/// Scenario: `EnsureConnected` on an instance whose orchestrator can't
/// resolve an address surfaces the collaborator failure directly, without
/// ever touching the rate limiter (no dial was attempted).
#[tokio::test]
async fn ensure_connected_surfaces_address_lookup_failure() {
    let dir = temp_key_dir("addrfail");
    let core = SshCore::new(&dir).await.unwrap();
    let orchestrator = MockOrchestrator::address_failing();
    let id = InstanceId(1);

    let err = core.ensure_connected(id, &orchestrator).await.unwrap_err();
    assert!(matches!(err, ConnectError::AddressLookup(_, _)));

    let snapshot = core.rate_limit_state(id).await;
    assert_eq!(snapshot.attempts_in_window, 0);

    core.shutdown().await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Scenario: the orchestrator resolves an address but refuses to install
/// the public key; `EnsureConnected` surfaces that as a `KeyUpload` error
/// and never reaches the dial step (no rate-limiter attempt recorded).
#[tokio::test]
async fn ensure_connected_surfaces_key_upload_failure() {
    let dir = temp_key_dir("uploadfail");
    let core = SshCore::new(&dir).await.unwrap();
    let orchestrator = MockOrchestrator::upload_failing("127.0.0.1", 1);
    let id = InstanceId(2);

    let err = core.ensure_connected(id, &orchestrator).await.unwrap_err();
    assert!(matches!(err, ConnectError::KeyUpload(_, _)));

    let snapshot = core.rate_limit_state(id).await;
    assert_eq!(snapshot.attempts_in_window, 0);
    assert_eq!(core.connection_state(id).await, ConnectionState::Disconnected);

    core.shutdown().await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Scenario 3 (rate limiter escalation): repeated `Connect` attempts
/// against an address nothing listens on eventually trip the sliding
/// window, independent of any orchestrator.
#[tokio::test]
async fn repeated_failed_connects_trip_the_sliding_window() {
    let dir = temp_key_dir("ratelimit");
    let core = SshCore::new(&dir).await.unwrap();
    let id = InstanceId(3);

    // Port 1 is a reserved port nothing binds to; the dial fails fast.
    for _ in 0..10 {
        let _ = core.connections.connect(id, "127.0.0.1", 1).await;
    }
    let err = core.connections.connect(id, "127.0.0.1", 1).await.unwrap_err();
    assert!(matches!(err, ConnectError::RateLimited { .. }));

    core.shutdown().await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Scenario 6 (IP restriction): once configured for an instance, a
/// restriction refuses `connect` before any network attempt, surfacing the
/// resolved outbound IP in the error.
#[tokio::test]
async fn configured_ip_restriction_refuses_connect() {
    let dir = temp_key_dir("iprestrict");
    let core = SshCore::new(&dir).await.unwrap();
    let id = InstanceId(4);

    core.set_ip_restriction(id, "203.0.113.0/24").await;
    let err = core.connections.connect(id, "8.8.8.8", 53).await.unwrap_err();
    match err {
        ConnectError::IpRestricted { instance_id, .. } => assert_eq!(instance_id, id),
        other => panic!("expected IpRestricted, got {other:?}"),
    }

    // Clearing the restriction (empty csv) falls through to the rate
    // limiter / dial path instead of refusing on IP grounds.
    core.set_ip_restriction(id, "").await;
    let err = core.connections.connect(id, "127.0.0.1", 1).await.unwrap_err();
    assert!(!matches!(err, ConnectError::IpRestricted { .. }));

    core.shutdown().await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Every event emitted for an instance reaches every registered listener,
/// via the core's fan-out, in addition to the ring buffer.
#[tokio::test]
async fn event_listener_observes_emitted_events() {
    let dir = temp_key_dir("events");
    let core = SshCore::new(&dir).await.unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    core.on_event(Arc::new(CountingListener(count.clone()))).await;

    let orchestrator = MockOrchestrator::reachable("127.0.0.1", 1);
    let id = InstanceId(5);
    let _ = core.ensure_connected(id, &orchestrator).await;

    // key_uploaded fires even though the subsequent dial fails.
    assert!(count.load(Ordering::SeqCst) >= 1);
    let history = core.event_history(id).await;
    assert!(!history.is_empty());

    core.shutdown().await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Background reconciliation against a running set with no live
/// connections is a no-op that doesn't panic or leave stray backoff state;
/// exercises `SshCore::start`/`shutdown` end to end without a real SSH peer.
#[tokio::test]
async fn start_and_shutdown_with_empty_running_set() {
    let dir = temp_key_dir("lifecycle");
    let core = SshCore::new(&dir).await.unwrap();
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(MockOrchestrator::reachable("127.0.0.1", 1));
    let lister: Arc<dyn InstanceLister> = Arc::new(MockLister(vec![]));

    core.start(lister, orchestrator).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    core.shutdown().await.unwrap();

    let _ = std::fs::remove_dir_all(&dir);
}

/// Needs an in-process SSH server accepting the core's generated key and an
/// echo-like remote command/listener to exercise the real handshake,
/// reverse-tunnel data flow, and reconnect-after-restart scenarios (2, 4, 5
/// in the design's concrete-scenario list). Left as a marker for whoever
/// wires up `russh::server` in a follow-up.
#[tokio::test]
#[ignore = "needs an in-process russh::server fixture to exercise a real handshake"]
async fn reverse_tunnel_carries_data_end_to_end() {
    unimplemented!("requires an in-process SSH server fixture")
}
