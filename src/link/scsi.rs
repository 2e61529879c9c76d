//! The backdoor byte stream tunnelled through a USB mass-storage drive.
//!
//! The patched firmware accepts two vendor CDBs: one whose Data-Out stage is
//! fed to the backdoor as if it arrived on the serial line, and one whose
//! Data-In stage returns whatever the backdoor has printed since the last
//! poll. The CSW residue tells how much of the Data-In buffer is real.

use std::collections::VecDeque;
use std::time::Duration;

use color_eyre::eyre::eyre;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, trace};

use super::Link;
use crate::error::{Error, Result};
use crate::scsi::{SCSIDevice, command};
use crate::usb::{self, Endpoints};

#[derive(Debug, Clone)]
pub struct ScsiLinkConfig {
    /// Vendor CDB opcode that carries host-to-target bytes.
    pub write_opcode: u8,
    /// Vendor CDB opcode that drains target-to-host bytes.
    pub read_opcode: u8,
    pub endpoints: Endpoints,
    /// Data-In allocation length of one poll.
    pub max_poll_bytes: u32,
    /// Pause between empty polls.
    pub poll_interval: Duration,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl Default for ScsiLinkConfig {
    fn default() -> Self {
        Self {
            write_opcode: 0xe0,
            read_opcode: 0xe1,
            endpoints: Endpoints::default(),
            max_poll_bytes: 512,
            poll_interval: Duration::from_millis(2),
            vendor_id: None,
            product_id: None,
        }
    }
}

pub struct ScsiLink {
    device: Option<SCSIDevice>,
    config: ScsiLinkConfig,
    /// Bytes from a poll that the caller didn't have room for yet.
    inbox: VecDeque<u8>,
}

impl ScsiLink {
    /// Finds the first mass-storage device matching the configured
    /// vendor/product filter and brings it up.
    #[tracing::instrument(skip_all)]
    pub async fn open(config: ScsiLinkConfig) -> Result<Self> {
        let (vendor_id, product_id) = (config.vendor_id, config.product_id);
        let info = usb::enumerate_usb_storage_devices()
            .await
            .map_err(Error::Scsi)?
            .find(|dev| {
                vendor_id.is_none_or(|vid| dev.vendor_id() == vid)
                    && product_id.is_none_or(|pid| dev.product_id() == pid)
            })
            .ok_or_else(|| Error::Scsi(eyre!("no matching USB mass storage device")))?;
        info!(
            "using {:04x}:{:04x}",
            info.vendor_id(),
            info.product_id()
        );
        let drive = usb::open_usb_device(info, config.endpoints)
            .await
            .map_err(Error::Scsi)?;
        let device = SCSIDevice::new(drive).await.map_err(Error::Scsi)?;
        Ok(Self {
            device: Some(device),
            config,
            inbox: VecDeque::new(),
        })
    }

    fn device(&mut self) -> Result<&mut SCSIDevice> {
        self.device.as_mut().ok_or(Error::LinkClosed)
    }

    /// One Data-In poll. Returns how many bytes were added to the inbox.
    async fn poll(&mut self) -> Result<usize> {
        let block = command::backdoor_read(self.config.read_opcode, self.config.max_poll_bytes);
        let data = self
            .device()?
            .issue_command(&block, &[])
            .await
            .map_err(Error::Scsi)?;
        trace!("polled {} bytes", data.len());
        self.inbox.extend(&data);
        Ok(data.len())
    }

    fn take_inbox(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbox.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl Link for ScsiLink {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let block = command::backdoor_write(self.config.write_opcode, bytes.len() as u32);
        self.device()?
            .issue_command(&block, bytes)
            .await
            .map_err(Error::Scsi)?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        while self.inbox.is_empty() {
            if self.poll().await? == 0 {
                if Instant::now() >= deadline {
                    return Ok(0);
                }
                sleep(self.config.poll_interval).await;
            }
        }
        Ok(self.take_inbox(buf))
    }

    async fn close(&mut self) -> Result<()> {
        if self.device.take().is_some() {
            debug!("releasing USB device");
        }
        self.inbox.clear();
        Ok(())
    }
}
