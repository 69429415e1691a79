//! Streams pose snapshots to TCP clients for the field visualizer.
//!
//! This is the one place in the crate where blocking is allowed: the
//! listener and each connection run on dedicated I/O threads. The control
//! loop stays decoupled by publishing snapshots into a [`PoseChannel`]; it
//! never touches a socket.

use std::{
    io::Write,
    net::{TcpListener, TcpStream},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};

use crate::geometry::Pose;

pub const DEFAULT_PORT: u16 = 8888;
const STREAM_PERIOD: Duration = Duration::from_millis(50);

/// Produces the pose to stream, or `None` when no pose is available.
pub type PoseSupplier = Box<dyn Fn() -> Option<Pose> + Send + Sync>;

/// A latest-value pose slot shared between the control thread and the I/O
/// threads. The control loop publishes; everyone else only reads.
#[derive(Clone, Default)]
pub struct PoseChannel {
    slot: Arc<Mutex<Option<Pose>>>,
}

impl PoseChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, pose: Pose) {
        *self.slot.lock() = Some(pose);
    }

    #[must_use]
    pub fn latest(&self) -> Option<Pose> {
        *self.slot.lock()
    }

    /// A supplier reading this channel, for [`TelemetryServer::enable`].
    #[must_use]
    pub fn supplier(&self) -> PoseSupplier {
        let slot = self.slot.clone();
        Box::new(move || *slot.lock())
    }
}

/// Listens on a TCP port and streams one JSON pose object per line, every
/// 50 ms, to each connected client.
pub struct TelemetryServer {
    supplier: Arc<RwLock<Option<PoseSupplier>>>,
    port: u16,
    started: bool,
}

impl TelemetryServer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_port(DEFAULT_PORT)
    }

    #[must_use]
    pub fn with_port(port: u16) -> Self {
        Self {
            supplier: Arc::new(RwLock::new(None)),
            port,
            started: false,
        }
    }

    /// Starts the listener thread. Safe to call repeatedly; only the first
    /// call binds.
    ///
    /// # Errors
    /// If the port cannot be bound or the listener thread cannot be spawned.
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.started {
            return Ok(());
        }
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        let supplier = self.supplier.clone();
        let _ = thread::Builder::new()
            .name(String::from("pose-telemetry"))
            .spawn(move || accept_loop(&listener, &supplier))?;
        self.started = true;
        tracing::debug!("pose telemetry listening on port {}", self.port);
        Ok(())
    }

    /// Installs the supplier whose poses get streamed.
    pub fn enable(&self, supplier: PoseSupplier) {
        *self.supplier.write() = Some(supplier);
    }

    /// Streams straight from a pose channel.
    pub fn enable_channel(&self, channel: &PoseChannel) {
        self.enable(channel.supplier());
    }

    /// Clears the supplier. The listener keeps running and connections stay
    /// open; they simply go quiet until a supplier is installed again.
    pub fn disable(&self) {
        *self.supplier.write() = None;
    }
}

impl Default for TelemetryServer {
    fn default() -> Self {
        Self::new()
    }
}

fn accept_loop(listener: &TcpListener, supplier: &Arc<RwLock<Option<PoseSupplier>>>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let supplier = supplier.clone();
                let spawned = thread::Builder::new()
                    .name(String::from("pose-telemetry-conn"))
                    .spawn(move || stream_poses(stream, &supplier));
                if let Err(error) = spawned {
                    tracing::warn!("could not spawn telemetry connection thread: {error}");
                }
            }
            Err(error) => tracing::warn!("telemetry accept failed: {error}"),
        }
    }
}

fn stream_poses(mut stream: TcpStream, supplier: &RwLock<Option<PoseSupplier>>) {
    loop {
        let line = {
            let guard = supplier.read();
            guard.as_ref().map(|supplier| render_line(supplier))
        };
        if let Some(line) = line {
            if stream.write_all(line.as_bytes()).is_err() {
                return;
            }
        }
        thread::sleep(STREAM_PERIOD);
    }
}

/// One wire line. A supplier that panics or has no pose yields the error
/// object; the stream itself keeps going.
fn render_line(supplier: &PoseSupplier) -> String {
    let pose = catch_unwind(AssertUnwindSafe(|| supplier())).ok().flatten();
    match pose {
        Some(pose) => format!(
            "{{\"x\":{:.4},\"y\":{:.4},\"heading\":{:.4}}}\n",
            pose.x, pose.y, pose.heading
        ),
        None => String::from("{\"error\":\"provider_error\"}\n"),
    }
}
