use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::registry::{DeviceRegistry, RegisteredDevice};
use super::{DeviceConfig, DeviceError, DeviceInfo, Result, Vendor};
use crate::scheduler::{
    build_registration_query, build_send_sms_chain, MetricsSnapshot, Scheduler, TaskChain, TaskEvent, TaskId,
};
use crate::serial::{HandleId, LineBuffer, ReadCallback, SerialInterface, Transport};

/// Owns the device registry and wires transports into schedulers.
///
/// Create one per process (or per test) and keep it alive for as long as any
/// of its devices is open.
pub struct ModemManager {
    registry: Arc<DeviceRegistry>,
}

impl ModemManager {
    pub fn new() -> Self {
        Self { registry: Arc::new(DeviceRegistry::new()) }
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    /// Open the serial port named in `config` and start its scheduler.
    pub async fn open(&self, config: &DeviceConfig) -> Result<Device> {
        config.validate()?;
        let interface = SerialInterface::open(&config.port, config.line_settings())?;
        self.attach(Arc::new(interface), config).await
    }

    /// Start a device on an already open transport.
    ///
    /// The device is registered before reads are enabled so the first inbound
    /// chunk always finds its buffer. On failure nothing stays registered and
    /// the transport is closed.
    pub async fn attach(&self, transport: Arc<dyn Transport>, config: &DeviceConfig) -> Result<Device> {
        let handle_id = transport.handle_id();
        let buffer = Arc::new(LineBuffer::new(config.buffer_capacity));
        let scheduler = Arc::new(Scheduler::new(transport.clone(), buffer.clone(), config.reply_capacity));
        let shared = Arc::new(RegisteredDevice {
            handle_id,
            port_name: transport.port_name().to_string(),
            vendor: config.vendor,
            buffer,
            scheduler: scheduler.clone(),
            opened_at: Utc::now(),
        });

        if let Err(e) = self.registry.register(&shared) {
            transport.close().await;
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = scheduler.spawn(shutdown_rx);

        let registry = self.registry.clone();
        let callback: ReadCallback = Arc::new(move |id, bytes| {
            registry.route(id, bytes);
        });

        if let Err(e) = transport.enable_async(callback).await {
            log::error!("Failed to start reader on {}: {}", shared.port_name, e);
            let _ = shutdown_tx.send(true);
            for worker in workers {
                let _ = worker.await;
            }
            self.registry.unregister(handle_id);
            transport.close().await;
            return Err(DeviceError::SerialError(e));
        }

        log::info!("Device {} attached on {} ({:?})", handle_id, shared.port_name, shared.vendor);
        Ok(Device {
            shared,
            transport,
            registry: self.registry.clone(),
            shutdown_tx,
            workers,
            closed: false,
        })
    }

    pub fn open_handles(&self) -> Vec<HandleId> {
        self.registry.handles()
    }

    /// Forget every registered device. Devices are owned by their callers,
    /// so anything still open is only reported, not closed.
    pub fn shutdown(&self) {
        let lingering = self.registry.clear();
        if !lingering.is_empty() {
            log::warn!("Modem manager shut down with {} device(s) still open: {:?}", lingering.len(), lingering);
        }
    }
}

impl Default for ModemManager {
    fn default() -> Self {
        Self::new()
    }
}

/// An open modem. Close it with [`Device::close`] to stop its reader and
/// workers and restore the port.
///
/// Dropping an unclosed device unregisters it and stops its workers at once.
/// Inside a tokio runtime the reader is stopped and the transport closed on a
/// background task; outside one the terminal settings are not restored.
pub struct Device {
    shared: Arc<RegisteredDevice>,
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Device {
    pub fn handle_id(&self) -> HandleId {
        self.shared.handle_id
    }

    pub fn port_name(&self) -> &str {
        &self.shared.port_name
    }

    pub fn vendor(&self) -> Vendor {
        self.shared.vendor
    }

    /// Queue a task chain; returns the id of its first task.
    pub async fn enqueue(&self, chain: impl Into<TaskChain>) -> Result<TaskId> {
        if *self.shutdown_tx.borrow() {
            return Err(DeviceError::Closed);
        }
        self.shared
            .scheduler
            .enqueue(chain.into())
            .await
            .ok_or_else(|| DeviceError::InvalidConfiguration("empty task chain".to_string()))
    }

    /// Queue an SMS submission. The outcome is observable through the event
    /// stream or callbacks on a hand-built chain, not through this call.
    pub async fn send_sms(&self, message: &str, number: &str) -> Result<TaskId> {
        log::info!("Queueing SMS to {} on {}", number, self.shared.port_name);
        self.enqueue(build_send_sms_chain(message, number)).await
    }

    pub async fn query_registration(&self) -> Result<TaskId> {
        self.enqueue(build_registration_query()).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.scheduler.subscribe_events()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.scheduler.metrics()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<MetricsSnapshot> {
        self.shared.scheduler.metrics_receiver()
    }

    /// False once the transport reader has died.
    pub fn is_transport_alive(&self) -> bool {
        self.transport.is_reading()
    }

    pub async fn pending_tasks(&self) -> usize {
        self.shared.scheduler.pending_tasks().await
    }

    pub async fn info(&self) -> DeviceInfo {
        DeviceInfo {
            handle_id: self.shared.handle_id,
            port_name: self.shared.port_name.clone(),
            vendor: self.shared.vendor,
            reading: self.transport.is_reading(),
            pending_tasks: self.pending_tasks().await,
            buffered_bytes: self.shared.buffer.len(),
            opened_at: self.shared.opened_at,
        }
    }

    /// Stop the reader, then the dispatcher and reply consumer, then release
    /// the buffer and transport. Queued tasks are discarded.
    pub async fn close(mut self) {
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.transport.disable_async().await;
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                log::error!("Worker for {} ended abnormally: {}", self.shared.handle_id, e);
            }
        }
        self.shared.scheduler.discard_pending().await;
        self.shared.buffer.clear();
        self.registry.unregister(self.shared.handle_id);
        self.transport.close().await;
        log::info!("Device {} on {} closed", self.shared.handle_id, self.shared.port_name);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let handle_id = self.shared.handle_id;
        let _ = self.shutdown_tx.send(true);
        self.registry.unregister(handle_id);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                log::warn!("Device {} dropped without close; releasing it in the background", handle_id);
                let transport = self.transport.clone();
                let workers = std::mem::take(&mut self.workers);
                runtime.spawn(async move {
                    transport.disable_async().await;
                    for worker in workers {
                        let _ = worker.await;
                    }
                    transport.close().await;
                });
            }
            Err(_) => {
                log::warn!(
                    "Device {} dropped without close outside a runtime; reader left to stop on drop, terminal settings not restored",
                    handle_id
                );
            }
        }
    }
}
