use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort};

use super::settings::LineSettings;
use super::transport::{HandleId, ReadCallback, Transport};
use super::{Result, SerialError};

/// Upper bound on a single read from the port.
pub const READ_CHUNK_SIZE: usize = 512;
/// How long the reader blocks on the readiness poll before re-checking its
/// stop flag.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

struct ReaderHandle {
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ReaderHandle {
    fn stop_and_join(self) {
        self.stop.store(true, Ordering::Release);
        if self.thread.join().is_err() {
            log::error!("Serial reader thread panicked");
        }
    }
}

/// `serialport`-backed transport for one open device node.
pub struct SerialInterface {
    id: HandleId,
    port_name: String,
    settings: Mutex<LineSettings>,
    port: SharedPort,
    reader: Mutex<Option<ReaderHandle>>,
    reader_alive: Arc<AtomicBool>,
    #[cfg(unix)]
    saved_termios: Mutex<Option<termios::SavedTermios>>,
}

impl SerialInterface {
    /// Open `port_name` with `settings`. Fails without touching the port when
    /// the settings are invalid or the node cannot be opened.
    pub fn open(port_name: &str, settings: LineSettings) -> Result<Self> {
        settings.validate()?;

        #[cfg(unix)]
        let saved = termios::SavedTermios::capture(port_name)
            .map_err(|e| SerialError::OpenFailed(format!("{}: {}", port_name, e)))?;

        let port = serialport::new(port_name, settings.baud_rate.0)
            .parity(settings.serial_parity())
            .data_bits(settings.serial_data_bits())
            .stop_bits(settings.serial_stop_bits())
            .flow_control(settings.serial_flow_control())
            .timeout(READ_POLL_INTERVAL)
            .open()
            .map_err(|e| SerialError::OpenFailed(format!("{}: {}", port_name, e)))?;

        port.clear(ClearBuffer::All)?;

        let id = HandleId::next();
        log::info!("Opened serial port {} as {} at {} baud", port_name, id, settings.baud_rate.0);

        Ok(Self {
            id,
            port_name: port_name.to_string(),
            settings: Mutex::new(settings),
            port: Arc::new(Mutex::new(Some(port))),
            reader: Mutex::new(None),
            reader_alive: Arc::new(AtomicBool::new(false)),
            #[cfg(unix)]
            saved_termios: Mutex::new(Some(saved)),
        })
    }

    pub fn settings(&self) -> LineSettings {
        *lock(&self.settings)
    }

    /// Apply new line settings. A rejected configuration leaves the previous
    /// settings in force.
    pub fn configure(&self, settings: LineSettings) -> Result<()> {
        settings.validate()?;

        let mut guard = lock(&self.port);
        let port = guard.as_mut().ok_or(SerialError::NotConnected)?;
        let previous = self.settings();

        if let Err(e) = apply_settings(port.as_mut(), &settings) {
            log::warn!("{} rejected {:?}: {}", self.port_name, settings, e);
            if let Err(e) = apply_settings(port.as_mut(), &previous) {
                log::error!("Failed to restore previous settings on {}: {}", self.port_name, e);
            }
            return Err(SerialError::ConfigurationRejected(e.to_string()));
        }

        *lock(&self.settings) = settings;
        log::info!("Reconfigured {}: {:?}", self.port_name, settings);
        Ok(())
    }

    fn take_reader(&self) -> Option<ReaderHandle> {
        lock(&self.reader).take()
    }

    fn spawn_reader(&self, callback: ReadCallback) -> Result<ReaderHandle> {
        let mut source = {
            let guard = lock(&self.port);
            let port = guard.as_ref().ok_or(SerialError::NotConnected)?;
            port.try_clone()?
        };

        let stop = Arc::new(AtomicBool::new(false));
        let alive = self.reader_alive.clone();
        alive.store(true, Ordering::Release);

        let id = self.id;
        let thread_stop = stop.clone();
        let thread_alive = alive.clone();
        let thread = std::thread::Builder::new()
            .name(format!("serial-reader-{}", id.0))
            .spawn(move || {
                let mut chunk = [0u8; READ_CHUNK_SIZE];
                while !thread_stop.load(Ordering::Acquire) {
                    match source.read(&mut chunk) {
                        Ok(0) => {}
                        Ok(n) => callback(id, &chunk[..n]),
                        Err(ref e)
                            if e.kind() == std::io::ErrorKind::TimedOut
                                || e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            log::error!("Serial reader {} stopped: {}", id, e);
                            break;
                        }
                    }
                }
                thread_alive.store(false, Ordering::Release);
            })
            .map_err(|e| {
                alive.store(false, Ordering::Release);
                SerialError::IoError(e)
            })?;

        Ok(ReaderHandle { stop, alive, thread })
    }
}

#[async_trait]
impl Transport for SerialInterface {
    fn handle_id(&self) -> HandleId {
        self.id
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.settings().access_mode.can_write() {
            return Err(SerialError::AccessDenied(format!("{} is read-only", self.port_name)));
        }

        let port = self.port.clone();
        let bytes = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut guard = lock(&port);
            let port = guard.as_mut().ok_or(SerialError::NotConnected)?;
            port.write_all(&bytes)?;
            // tcdrain on unix: returns once the bytes are on the wire
            port.flush()?;
            Ok(bytes.len())
        })
        .await
        .map_err(|e| SerialError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    async fn enable_async(&self, callback: ReadCallback) -> Result<()> {
        if !self.settings().access_mode.can_read() {
            return Err(SerialError::AccessDenied(format!("{} is write-only", self.port_name)));
        }

        self.disable_async().await;
        let handle = self.spawn_reader(callback)?;
        *lock(&self.reader) = Some(handle);
        log::debug!("Async reads enabled on {}", self.port_name);
        Ok(())
    }

    async fn disable_async(&self) {
        if let Some(handle) = self.take_reader() {
            let alive = handle.alive.clone();
            if tokio::task::spawn_blocking(move || handle.stop_and_join()).await.is_err() {
                log::error!("Failed to join serial reader for {}", self.port_name);
            }
            alive.store(false, Ordering::Release);
            log::debug!("Async reads disabled on {}", self.port_name);
        }
    }

    fn is_reading(&self) -> bool {
        self.reader_alive.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.disable_async().await;

        let had_port = lock(&self.port).take().is_some();

        #[cfg(unix)]
        if let Some(saved) = lock(&self.saved_termios).take() {
            if let Err(e) = saved.restore() {
                log::warn!("Failed to restore terminal settings on {}: {}", self.port_name, e);
            }
        }

        if had_port {
            log::info!("Closed serial port {}", self.port_name);
        }
    }
}

impl Drop for SerialInterface {
    fn drop(&mut self) {
        if let Some(handle) = self.take_reader() {
            handle.stop.store(true, Ordering::Release);
        }
    }
}

fn apply_settings(port: &mut dyn SerialPort, settings: &LineSettings) -> serialport::Result<()> {
    port.set_baud_rate(settings.baud_rate.0)?;
    port.set_parity(settings.serial_parity())?;
    port.set_data_bits(settings.serial_data_bits())?;
    port.set_stop_bits(settings.serial_stop_bits())?;
    port.set_flow_control(settings.serial_flow_control())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(unix)]
mod termios {
    use std::fs::{File, OpenOptions};
    use std::os::unix::fs::OpenOptionsExt;

    use nix::fcntl::OFlag;
    use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, Termios};

    /// Terminal attributes that were in force before the port was opened.
    pub(super) struct SavedTermios {
        file: File,
        termios: Termios,
    }

    impl SavedTermios {
        pub(super) fn capture(path: &str) -> std::io::Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
                .open(path)?;
            let termios = tcgetattr(&file)?;
            Ok(Self { file, termios })
        }

        pub(super) fn restore(&self) -> nix::Result<()> {
            tcsetattr(&self.file, SetArg::TCSANOW, &self.termios)
        }
    }
}
