//! The bit-bang serial port: LED output as RX, eject button as TX, 57600/8-N-1.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::debug;

use super::Link;
use crate::error::{Error, Result};

pub const BAUD_RATE: u32 = 57_600;

pub struct SerialLink {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    #[tracing::instrument]
    pub fn open(path: &str) -> Result<Self> {
        debug!("opening serial port");
        let port = serialport::new(path, BAUD_RATE)
            .timeout(Duration::from_secs(1))
            .open()?;
        Ok(Self { port: Some(port) })
    }

    /// Run a blocking port operation off the async executor.
    async fn with_port<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SerialPort) -> Result<T> + Send + 'static,
    {
        let mut port = self.port.take().ok_or(Error::LinkClosed)?;
        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = f(port.as_mut());
            (port, result)
        })
        .await
        .map_err(std::io::Error::other)?;
        self.port = Some(port);
        result
    }
}

impl Link for SerialLink {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let bytes = bytes.to_vec();
        self.with_port(move |port| {
            port.write_all(&bytes)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let len = buf.len();
        let received = self
            .with_port(move |port| {
                port.set_timeout(timeout)?;
                let mut scratch = vec![0; len];
                match port.read(&mut scratch) {
                    Ok(n) => {
                        scratch.truncate(n);
                        Ok(scratch)
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        buf[..received.len()].copy_from_slice(&received);
        Ok(received.len())
    }

    async fn close(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }
}
