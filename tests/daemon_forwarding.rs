//! End-to-end flow through the control loop: sample pipe → socket writer,
//! client disconnect → reaper, and the accelerometer producer stream.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use sensord::daemon::{self, ControlEvent};
use sensord::loader::PluginRegistry;
use sensord::manager::SensorManager;
use sensord::pipe;
use sensord::plugins::accelerometer::AccelFrame;
use sensord::socket::UnixSocketHandler;
use sensord::transport::LocalTransport;
use sensord::SessionId;

struct Harness {
    manager: SensorManager,
    samples: pipe::SampleReceiver,
    lost_sessions: mpsc::UnboundedReceiver<SessionId>,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    events_rx: mpsc::UnboundedReceiver<ControlEvent>,
}

fn build(socket_path: &Path) -> Harness {
    let (sink, samples) = pipe::channel(32);
    let (socket, lost_sessions) = UnixSocketHandler::listen(socket_path).expect("listen");
    let mut manager = SensorManager::new(
        socket,
        Box::new(LocalTransport::new()),
        sink,
        PluginRegistry::with_builtin_plugins(),
    );
    manager.register_service().expect("register service");
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    Harness {
        manager,
        samples,
        lost_sessions,
        events_tx,
        events_rx,
    }
}

/// Moves the harness into a spawned control loop; returns its join handle
/// plus the shutdown trigger.
fn spawn(
    harness: Harness,
) -> (
    tokio::task::JoinHandle<SensorManager>,
    oneshot::Sender<()>,
) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(daemon::run(
        harness.manager,
        harness.samples,
        harness.lost_sessions,
        harness.events_rx,
        shutdown_rx,
    ));
    (handle, shutdown_tx)
}

async fn connect(path: &Path, session: SessionId) -> UnixStream {
    let mut stream = UnixStream::connect(path).await.expect("connect");
    stream
        .write_all(&session.to_le_bytes())
        .await
        .expect("handshake");
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).await.expect("ack");
    stream
}

#[tokio::test]
async fn pipe_records_reach_the_session_socket_verbatim() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("sensord.sock");
    let harness = build(&socket_path);
    let sink = harness.manager.sample_sink();
    let (control, shutdown) = spawn(harness);

    let mut client = connect(&socket_path, 5).await;

    let producer = std::thread::spawn(move || {
        let payload: Vec<u8> = (0..128).collect();
        assert!(sink.write(5, &payload));
    });

    let mut received = vec![0u8; 128];
    timeout(Duration::from_secs(5), client.read_exact(&mut received))
        .await
        .expect("sample within deadline")
        .expect("read");
    assert_eq!(received, (0..128).collect::<Vec<u8>>());

    producer.join().expect("producer thread");
    let _ = shutdown.send(());
    control.await.expect("control loop");
}

#[tokio::test]
async fn client_disconnect_reaps_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("sensord.sock");
    let mut harness = build(&socket_path);

    harness.manager.load_plugin("mocksensor").expect("plugin");
    let session = harness
        .manager
        .request_listen("mocksensor")
        .expect("listen");

    let (control, shutdown) = spawn(harness);

    let client = connect(&socket_path, session).await;
    drop(client);

    // Give the socket handler and control loop a moment to reap.
    sleep(Duration::from_millis(200)).await;
    let _ = shutdown.send(());
    let manager = control.await.expect("control loop");

    let status = manager.sensor_status("mocksensor").expect("status");
    assert!(!status.present);
    assert!(status.listen_sessions.is_empty());
}

#[tokio::test]
async fn accelerometer_sessions_stream_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("sensord.sock");
    let mut harness = build(&socket_path);

    harness
        .manager
        .load_plugin("accelerometersensor")
        .expect("plugin");
    let session = harness
        .manager
        .request_listen("accelerometersensor;interval=10")
        .expect("listen");
    let started = harness
        .manager
        .with_sensor("accelerometersensor", |sensor| sensor.start(session))
        .expect("instance");
    assert!(started);

    let (control, shutdown) = spawn(harness);

    let mut client = connect(&socket_path, session).await;
    let mut bytes = [0u8; AccelFrame::SIZE];
    timeout(Duration::from_secs(5), client.read_exact(&mut bytes))
        .await
        .expect("frame within deadline")
        .expect("read");

    let frame = AccelFrame::from_bytes(&bytes);
    assert_eq!((frame.x, frame.y, frame.z), (0.0, 0.0, 9.81));
    assert!(frame.timestamp_us > 0);

    let _ = shutdown.send(());
    let mut manager = control.await.expect("control loop");
    manager
        .with_sensor("accelerometersensor", |sensor| sensor.stop(session))
        .expect("instance");
    manager
        .release("accelerometersensor", session)
        .expect("release");
    assert!(
        !manager
            .sensor_status("accelerometersensor")
            .expect("status")
            .present
    );
}

#[tokio::test]
async fn control_events_reach_the_power_hooks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("sensord.sock");
    let harness = build(&socket_path);
    let events = harness.events_tx.clone();
    let (control, shutdown) = spawn(harness);

    events
        .send(ControlEvent::Display(false))
        .expect("event enqueued");
    events
        .send(ControlEvent::PowerSave(true))
        .expect("event enqueued");
    sleep(Duration::from_millis(100)).await;

    let _ = shutdown.send(());
    let manager = control.await.expect("control loop");
    assert!(!manager.display_state());
    assert!(manager.psm_state());
}
