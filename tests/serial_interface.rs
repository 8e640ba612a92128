#![cfg(unix)]

mod common;

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use nix::pty::openpty;
use nix::unistd::ttyname;
use tokio::sync::mpsc;

use common::init_logging;
use gsmlink::serial::{AccessMode, LineSettings, ReadCallback, SerialError, SerialInterface, Transport};

/// Pseudo-terminal pair; the interface opens the slave, the test drives the
/// master as if it were the modem.
struct Pty {
    master: File,
    path: String,
    _slave: OwnedFd,
}

fn open_pty() -> Pty {
    let pty = openpty(None, None).expect("openpty");
    let path = ttyname(&pty.slave).expect("ttyname").to_string_lossy().into_owned();
    Pty { master: File::from(pty.master), path, _slave: pty.slave }
}

fn collecting_callback() -> (ReadCallback, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ReadCallback = Arc::new(move |_, bytes| {
        let _ = tx.send(bytes.to_vec());
    });
    (callback, rx)
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, len: usize) -> Vec<u8> {
    let mut received = Vec::new();
    while received.len() < len {
        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for inbound bytes")
            .expect("callback dropped");
        received.extend_from_slice(&chunk);
    }
    received
}

async fn read_master(master: &File, len: usize) -> Vec<u8> {
    let mut master = master.try_clone().unwrap();
    let read = tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        master.read_exact(&mut buf).map(|_| buf)
    });
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("timed out reading the master side")
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reader_delivers_inbound_bytes() {
    init_logging();
    let mut pty = open_pty();
    let interface = SerialInterface::open(&pty.path, LineSettings::new(115200)).unwrap();
    assert!(!interface.is_reading());

    let (callback, mut rx) = collecting_callback();
    interface.enable_async(callback).await.unwrap();
    assert!(interface.is_reading());

    pty.master.write_all(b"OK\r\n").unwrap();
    assert_eq!(collect(&mut rx, 4).await, b"OK\r\n");

    interface.close().await;
    assert!(!interface.is_reading());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_reaches_the_line() {
    init_logging();
    let pty = open_pty();
    let interface = SerialInterface::open(&pty.path, LineSettings::new(115200)).unwrap();

    assert_eq!(interface.write(b"AT\r\n").await.unwrap(), 4);
    assert_eq!(read_master(&pty.master, 4).await, b"AT\r\n");
    interface.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enable_async_replaces_previous_reader() {
    init_logging();
    let mut pty = open_pty();
    let interface = SerialInterface::open(&pty.path, LineSettings::new(115200)).unwrap();

    let (first, mut first_rx) = collecting_callback();
    let (second, mut second_rx) = collecting_callback();
    interface.enable_async(first).await.unwrap();
    interface.enable_async(second).await.unwrap();

    pty.master.write_all(b"+CSQ: 18,0\r\n").unwrap();
    assert_eq!(collect(&mut second_rx, 12).await, b"+CSQ: 18,0\r\n");
    assert!(first_rx.try_recv().is_err());
    interface.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disable_async_is_repeatable() {
    init_logging();
    let mut pty = open_pty();
    let interface = SerialInterface::open(&pty.path, LineSettings::new(115200)).unwrap();

    interface.disable_async().await;
    let (callback, _rx) = collecting_callback();
    interface.enable_async(callback).await.unwrap();
    interface.disable_async().await;
    interface.disable_async().await;
    assert!(!interface.is_reading());

    let (callback, mut rx) = collecting_callback();
    interface.enable_async(callback).await.unwrap();
    pty.master.write_all(b"OK\r\n").unwrap();
    assert_eq!(collect(&mut rx, 4).await, b"OK\r\n");

    interface.close().await;
    interface.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_access_mode_is_enforced() {
    init_logging();
    let pty = open_pty();
    let mut settings = LineSettings::new(115200);
    settings.access_mode = AccessMode::ReadOnly;
    let interface = SerialInterface::open(&pty.path, settings).unwrap();
    assert!(matches!(interface.write(b"AT\r\n").await, Err(SerialError::AccessDenied(_))));
    interface.close().await;

    let pty = open_pty();
    settings.access_mode = AccessMode::WriteOnly;
    let interface = SerialInterface::open(&pty.path, settings).unwrap();
    let (callback, _rx) = collecting_callback();
    assert!(matches!(interface.enable_async(callback).await, Err(SerialError::AccessDenied(_))));
    assert!(!interface.is_reading());
    interface.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_configuration_keeps_settings() {
    init_logging();
    let pty = open_pty();
    let interface = SerialInterface::open(&pty.path, LineSettings::new(115200)).unwrap();

    let rejected = interface.configure(LineSettings::new(31337));
    assert!(matches!(rejected, Err(SerialError::ConfigurationRejected(_))));
    assert_eq!(interface.settings(), LineSettings::new(115200));

    interface.configure(LineSettings::new(19200)).unwrap();
    assert_eq!(interface.settings(), LineSettings::new(19200));
    interface.close().await;
}

#[test]
fn test_open_missing_port_fails() {
    let result = SerialInterface::open("/dev/gsmlink-no-such-port", LineSettings::new(115200));
    assert!(matches!(result, Err(SerialError::OpenFailed(_))));
}
