//! Forwarding engine: joins the tunnel mapping with the mux event stream and
//! owns every TCP listener the daemon binds.
//!
//! All registry and listener-set mutations go through one mutex, so listener
//! bind-or-teardown for a device is serialized and the engine never holds
//! listeners for a device it no longer believes attached. The mapping index
//! is swapped wholesale under the same lock on reload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::error::{AppError, Result};
use crate::mapping::{Forwarding, MappingIndex, TunnelRule};
use crate::mux::{MuxClient, MuxEvent, MuxSubscription};
use crate::pump::{self, PumpEnd};

#[derive(Debug, Default)]
pub struct Counters {
    pub tunnels_created: AtomicU64,
    pub tunnel_timeouts: AtomicU64,
    /// Always zero. The finalizer race the original counted cannot happen
    /// here; the field stays so the status JSON keeps its shape.
    pub lazy_exceptions: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mapping_path: PathBuf,
    pub tunnel_timeout: Option<Duration>,
    /// Stop the whole daemon when a listener cannot be bound, instead of
    /// logging and carrying on without it.
    pub exit_on_os_error: bool,
}

pub struct Engine {
    mux: MuxClient,
    config: EngineConfig,
    counters: Counters,
    started_at: Instant,
    state: Mutex<EngineState>,
}

struct EngineState {
    mapping: Arc<MappingIndex>,
    /// Mux-assigned device id to UDID, fed by the event stream.
    devices: HashMap<i32, String>,
    listeners: HashMap<i32, Vec<ListenerHandle>>,
}

struct ListenerHandle {
    local_port: u16,
    device_port: u16,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Engine {
    pub fn new(mux: MuxClient, mapping: MappingIndex, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            mux,
            config,
            counters: Counters::default(),
            started_at: Instant::now(),
            state: Mutex::new(EngineState {
                mapping: Arc::new(mapping),
                devices: HashMap::new(),
                listeners: HashMap::new(),
            }),
        })
    }

    /// Open the mux subscription, accumulate the initial burst of events for
    /// the discovery window, then bind listeners for every attached mapped
    /// device in one batch. The returned subscription carries the ongoing
    /// event stream and must be drained through [`Engine::handle_event`].
    pub async fn start(self: &Arc<Self>) -> Result<MuxSubscription> {
        let mut subscription = self.mux.subscribe().await?;

        let deadline = tokio::time::Instant::now() + config::DISCOVERY_WINDOW;
        loop {
            match tokio::time::timeout_at(deadline, subscription.next_event()).await {
                Err(_) => break,
                Ok(Ok(event)) => self.record_discovery(event),
                Ok(Err(e)) => return Err(e),
            }
        }

        let targets = {
            let state = self.state.lock().unwrap();
            discovery_targets(&state)
        };
        let bound = self.bind_devices(targets).await?;
        info!(
            devices = ?self.device_count(),
            listeners = ?bound,
            "forwarding engine started"
        );
        Ok(subscription)
    }

    /// During the discovery window only the registry is maintained; no
    /// listener exists yet, so attach/detach is pure bookkeeping.
    fn record_discovery(&self, event: MuxEvent) {
        let mut state = self.state.lock().unwrap();
        match event {
            MuxEvent::Attached(props) => {
                debug!(
                    device_id = ?props.device_id,
                    serial = ?props.serial_number,
                    "device present at startup"
                );
                state.devices.insert(props.device_id, props.serial_number);
            }
            MuxEvent::Detached { device_id } => {
                state.devices.remove(&device_id);
            }
        }
    }

    /// React to one ongoing mux event. Errors only surface when a listener
    /// bind fails and `exit_on_os_error` is set; everything else is logged
    /// and absorbed.
    pub async fn handle_event(self: &Arc<Self>, event: MuxEvent) -> Result<()> {
        match event {
            MuxEvent::Attached(props) => {
                let rule = {
                    let mut state = self.state.lock().unwrap();
                    if state.devices.contains_key(&props.device_id) {
                        debug!(device_id = ?props.device_id, "duplicate attach, refreshing");
                        return Ok(());
                    }
                    state
                        .devices
                        .insert(props.device_id, props.serial_number.clone());
                    state.mapping.get(&props.serial_number).cloned()
                };
                info!(
                    device_id = ?props.device_id,
                    serial = ?props.serial_number,
                    "device attached"
                );
                match rule {
                    Some(rule) => {
                        self.bind_devices(vec![(props.device_id, rule)]).await?;
                    }
                    None => {
                        debug!(serial = ?props.serial_number, "device is not in the mapping");
                    }
                }
                Ok(())
            }
            MuxEvent::Detached { device_id } => {
                let handles = {
                    let mut state = self.state.lock().unwrap();
                    state.devices.remove(&device_id);
                    state.listeners.remove(&device_id)
                };
                info!(device_id = ?device_id, "device detached");
                if let Some(handles) = handles {
                    stop_listeners(handles).await;
                }
                Ok(())
            }
        }
    }

    /// Reload the mapping file and rebuild listeners from the current device
    /// registry. On a load failure the previous mapping and the full
    /// previous listener set stay in place.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        info!(
            path = ?self.config.mapping_path.display().to_string(),
            "reloading mapping"
        );
        let new_mapping = match MappingIndex::load(&self.config.mapping_path) {
            Ok(mapping) => mapping,
            Err(e) => {
                error!(
                    error = ?e.to_string(),
                    "mapping reload failed, keeping previous mapping and listeners"
                );
                return Ok(());
            }
        };

        let (old, targets) = {
            let mut state = self.state.lock().unwrap();
            let old: Vec<Vec<ListenerHandle>> =
                state.listeners.drain().map(|(_, handles)| handles).collect();
            state.mapping = Arc::new(new_mapping);
            (old, discovery_targets(&state))
        };

        // Wait for the old sockets to actually close before rebinding the
        // same ports.
        for handles in old {
            stop_listeners(handles).await;
        }

        let bound = self.bind_devices(targets).await?;
        info!(listeners = ?bound, "forwarding engine restarted");
        Ok(())
    }

    /// Stop every listener and clear the set. Tunnels that are mid-pump are
    /// left to finish on their own.
    pub async fn complete_shutdown(&self) {
        let all: Vec<Vec<ListenerHandle>> = {
            let mut state = self.state.lock().unwrap();
            state.listeners.drain().map(|(_, handles)| handles).collect()
        };
        for handles in all {
            stop_listeners(handles).await;
        }
        info!("forwarding engine shut down");
    }

    /// Bind listeners for `(device_id, rule)` pairs, all in parallel. A bind
    /// failure is fatal only with `exit_on_os_error`; otherwise the listener
    /// is skipped and logged.
    async fn bind_devices(self: &Arc<Self>, targets: Vec<(i32, TunnelRule)>) -> Result<usize> {
        let mut binds = Vec::new();
        for (device_id, rule) in targets {
            for forwarding in rule.forwarding {
                let engine = Arc::clone(self);
                binds.push(tokio::spawn(async move {
                    engine.bind_listener(device_id, forwarding).await
                }));
            }
        }

        let mut bound = 0usize;
        for bind in binds {
            let result = bind
                .await
                .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
            match result {
                Ok(()) => bound += 1,
                Err(e) if self.config.exit_on_os_error => return Err(e),
                Err(e) => {
                    error!(error = ?e.to_string(), "listener bind failed, skipping port");
                }
            }
        }
        Ok(bound)
    }

    async fn bind_listener(self: Arc<Self>, device_id: i32, forwarding: Forwarding) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", forwarding.local_port)).await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&self).run_listener(
            listener,
            device_id,
            forwarding.clone(),
            stop_rx,
        ));
        let handle = ListenerHandle {
            local_port: forwarding.local_port,
            device_port: forwarding.device_port,
            stop: stop_tx,
            task,
        };

        let mut state = self.state.lock().unwrap();
        if !state.devices.contains_key(&device_id) {
            // The device detached while we were binding; undo rather than
            // leave a listener for a device the registry no longer has.
            drop(state);
            let _ = handle.stop.send(true);
            debug!(device_id = ?device_id, "device detached during bind, dropping listener");
            return Ok(());
        }
        info!(
            device_id = ?device_id,
            local_port = ?forwarding.local_port,
            device_port = ?forwarding.device_port,
            "listener bound"
        );
        state.listeners.entry(device_id).or_default().push(handle);
        Ok(())
    }

    async fn run_listener(
        self: Arc<Self>,
        listener: TcpListener,
        device_id: i32,
        forwarding: Forwarding,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        debug!(
                            peer = ?peer.to_string(),
                            local_port = ?forwarding.local_port,
                            "client accepted"
                        );
                        let engine = Arc::clone(&self);
                        let device_port = forwarding.device_port;
                        tokio::spawn(async move {
                            engine.handle_client(client, device_id, device_port).await;
                        });
                    }
                    Err(e) => {
                        warn!(
                            error = ?e.to_string(),
                            local_port = ?forwarding.local_port,
                            "accept failed"
                        );
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!(local_port = ?forwarding.local_port, "listener stopped");
    }

    /// One accepted client: negotiate the mux leg, then pump until a side
    /// closes. Connect refusals keep the listener alive for future accepts.
    async fn handle_client(self: Arc<Self>, client: TcpStream, device_id: i32, device_port: u16) {
        let mux_stream = match self.mux.connect_device(device_id, device_port).await {
            Ok(stream) => stream,
            Err(
                e @ (AppError::DeviceNotConnected(_) | AppError::PortNotAvailable { .. }),
            ) => {
                info!(error = ?e.to_string(), "mux refused tunnel, dropping client");
                return;
            }
            Err(e) => {
                warn!(error = ?e.to_string(), "mux connect failed, dropping client");
                return;
            }
        };

        self.counters.tunnels_created.fetch_add(1, Ordering::Relaxed);
        debug!(
            device_id = ?device_id,
            device_port = ?device_port,
            "tunnel established"
        );

        match pump::run(client, mux_stream, self.config.tunnel_timeout).await {
            PumpEnd::Eof | PumpEnd::Stopped => {
                debug!(device_id = ?device_id, "tunnel closed");
            }
            PumpEnd::IdleTimeout => {
                self.counters.tunnel_timeouts.fetch_add(1, Ordering::Relaxed);
                info!(
                    device_id = ?device_id,
                    device_port = ?device_port,
                    "tunnel closed after idle timeout"
                );
            }
            PumpEnd::PeerReset(e) => {
                info!(error = ?e.to_string(), "client closed tunnel with error");
            }
            PumpEnd::Error(e) => {
                error!(error = ?e.to_string(), "tunnel ended unexpectedly");
            }
        }
    }

    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.state.lock().unwrap().devices.len()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .listeners
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Snapshot for the status endpoint. Field names and casing are part of
    /// the external contract.
    #[must_use]
    pub fn status_report(&self) -> StatusReport {
        let state = self.state.lock().unwrap();
        let mut status_data: Vec<DeviceStatus> = state
            .listeners
            .iter()
            .map(|(device_id, handles)| {
                let udid = state.devices.get(device_id).cloned().unwrap_or_default();
                let nickname = state
                    .mapping
                    .get(&udid)
                    .and_then(|rule| rule.name.clone())
                    .unwrap_or_else(|| "<Unnamed>".to_string());
                DeviceStatus {
                    nickname,
                    device_id: *device_id,
                    udid,
                    tunnels: handles
                        .iter()
                        .map(|h| TunnelStatus {
                            local_port: h.local_port,
                            device_port: h.device_port,
                        })
                        .collect(),
                }
            })
            .collect();
        status_data.sort_by_key(|d| d.device_id);

        StatusReport {
            uptime: self.started_at.elapsed().as_secs_f64(),
            async_exceptions_count: self.counters.lazy_exceptions.load(Ordering::Relaxed),
            tunnels_created_count: self.counters.tunnels_created.load(Ordering::Relaxed),
            tunnel_timeouts: self.counters.tunnel_timeouts.load(Ordering::Relaxed),
            mappings_file: self.config.mapping_path.display().to_string(),
            status_data,
        }
    }
}

fn discovery_targets(state: &EngineState) -> Vec<(i32, TunnelRule)> {
    state
        .devices
        .iter()
        .filter_map(|(device_id, udid)| {
            state
                .mapping
                .get(udid)
                .map(|rule| (*device_id, rule.clone()))
        })
        .collect()
}

async fn stop_listeners(handles: Vec<ListenerHandle>) {
    for handle in handles {
        let _ = handle.stop.send(true);
        if let Err(e) = handle.task.await {
            warn!(error = ?e.to_string(), "listener task ended abnormally");
        }
        debug!(local_port = ?handle.local_port, "listener shut down");
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub uptime: f64,
    pub async_exceptions_count: u64,
    pub tunnels_created_count: u64,
    pub tunnel_timeouts: u64,
    pub mappings_file: String,
    pub status_data: Vec<DeviceStatus>,
}

#[derive(Debug, Serialize)]
pub struct DeviceStatus {
    #[serde(rename = "Nickname")]
    pub nickname: String,
    #[serde(rename = "Usbmuxd assigned iDevice ID")]
    pub device_id: i32,
    #[serde(rename = "iDevice UDID")]
    pub udid: String,
    #[serde(rename = "Tunnels")]
    pub tunnels: Vec<TunnelStatus>,
}

#[derive(Debug, Serialize)]
pub struct TunnelStatus {
    #[serde(rename = "Local Port")]
    pub local_port: u16,
    #[serde(rename = "Device Port")]
    pub device_port: u16,
}
