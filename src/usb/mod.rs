//! Interactions with USB mass storage devices

pub mod cbw;

// Scratchpad:
// https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/

// Optical drives use the mass storage class (0x08), MMC subclass (0x02) or SCSI transparent
// (0x06), and the bulk-only transport protocol (0x50). There are two bulk endpoints, one OUT and
// one IN. The host sends a 31-byte CBW, optionally moves data, then reads a 13-byte CSW.

use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{ensure, eyre};
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, ControlIn, ControlType, In, Out, Recipient};
use nusb::{Device, DeviceInfo, list_devices};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::scsi::command::CommandBlock;
use cbw::{
    CBWDirection, CSW_SIZE, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, TagGenerator,
};

/// https://www.usb.org/defined-class-codes
const MASS_STORAGE_USB_CLASS: u8 = 0x08;

/// Returns a list of every USB storage device currently connected to the host machine
pub async fn enumerate_usb_storage_devices() -> Result<impl Iterator<Item = DeviceInfo>> {
    let all_usb_devices = list_devices().await?;

    // Each USB device typically exposes one or more *interfaces* as a
    // way to interact with specific functionality of the device.
    let usb_storage_devices = all_usb_devices.filter(|dev| {
        debug!("scanning usb device: {:#?}", dev);
        dev.class() == MASS_STORAGE_USB_CLASS
            || dev
                .interfaces()
                .any(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
    });
    Ok(usb_storage_devices)
}

/// Bulk endpoint addresses of the mass storage interface.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            bulk_in: 0x81,
            bulk_out: 0x02,
        }
    }
}

pub struct USBDrive {
    bulk_write: EndpointWrite<Bulk>,
    bulk_read: EndpointRead<Bulk>,
    tags: TagGenerator,
}

/// As described by  the USB Mass Storage Class - Bulk Only Transport spec,
/// section 3.2.
///
/// LUN stands for Logical Unit Number, and it's a number
/// used as a unique identifier for a storage device or logical volume.
///
/// <https://en.wikipedia.org/wiki/Logical_unit_number>
const MAX_LUN_REQUEST: ControlIn = ControlIn {
    control_type: ControlType::Class,
    recipient: Recipient::Interface,
    request: 0xfe,
    value: 0,
    index: 0,
    length: 1,
};

/// Opens the provided USB mass storage device.
///
/// This initialization sequence follows the order
/// described here: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>,
///
/// where the author obtained it with a USB hardware signal analyzer and reverse engineering the implementations on macos, windows, and linux
#[tracing::instrument(skip(device_info))]
pub async fn open_usb_device(device_info: DeviceInfo, endpoints: Endpoints) -> Result<USBDrive> {
    // 1. Claim the USB device to read and write to it
    debug!(
        "opening device {:04x}:{:04x}",
        device_info.vendor_id(),
        device_info.product_id()
    );
    let device: Device = device_info.open().await?;
    let interface: nusb::Interface = device.claim_interface(0).await?;
    // 2. Request the maximum LUN. Single-LUN devices may stall this request.
    match interface
        .control_in(MAX_LUN_REQUEST, Duration::from_millis(500))
        .await
    {
        Ok(max_lun) => ensure!(
            max_lun.first().copied().unwrap_or(0) == 0,
            "devices with more than one LUN are not supported"
        ),
        Err(e) => warn!("GET MAX LUN failed, assuming a single LUN: {e}"),
    }

    let writer = interface
        .endpoint::<Bulk, Out>(endpoints.bulk_out)?
        .writer(128)
        .with_num_transfers(8);

    let reader = interface
        .endpoint::<Bulk, In>(endpoints.bulk_in)?
        .reader(128)
        .with_num_transfers(8);

    Ok(USBDrive {
        bulk_write: writer,
        bulk_read: reader,
        tags: TagGenerator::new(),
    })
}

impl USBDrive {
    /// Runs one bulk-only transaction: CBW, optional data stage, CSW.
    ///
    /// Returns the Data-In bytes with the residue trimmed off; empty for
    /// other directions.
    pub async fn submit_cbw(&mut self, command: &CommandBlock, data_out: &[u8]) -> Result<Vec<u8>> {
        let tag = self.tags.tag();
        let cbw = CommandBlockWrapper::new(command, tag);
        self.bulk_write.write_all(&cbw.to_bytes()).await?;
        self.bulk_write.flush().await?;

        let mut data = Vec::new();
        match command.direction {
            CBWDirection::DataOut => {
                ensure!(
                    data_out.len() == command.data_transfer_len as usize,
                    "data stage is {} bytes, CBW announced {}",
                    data_out.len(),
                    command.data_transfer_len
                );
                self.bulk_write.write_all(data_out).await?;
                self.bulk_write.flush().await?;
            }
            CBWDirection::DataIn => {
                // The drive may end the stage early with a short packet.
                let mut stage = self.bulk_read.until_short_packet();
                data = read_data_stage(&mut stage, command.data_transfer_len).await?;
                if stage.is_end() {
                    stage
                        .consume_end()
                        .map_err(|_| eyre!("data stage did not end on a short packet"))?;
                }
            }
            CBWDirection::NonDirectional => {}
        }

        let mut csw = [0u8; CSW_SIZE];
        self.bulk_read.read_exact(&mut csw).await?;
        let csw = CommandStatusWrapper::from_slice(&csw)?;
        ensure!(
            csw.tag == tag,
            "CSW tag {} does not match CBW tag {tag}",
            csw.tag
        );
        if csw.status != CommandStatus::Passed {
            return Err(eyre!("command failed with status {:?}", csw.status));
        }
        let valid = data.len().saturating_sub(csw.data_residue as usize);
        data.truncate(valid);
        Ok(data)
    }
}

/// Reads at most `len` bytes, stopping early when `stage` runs dry.
async fn read_data_stage<R: AsyncRead + Unpin>(stage: R, len: u32) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len as usize);
    stage.take(u64::from(len)).read_to_end(&mut data).await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_data_stage_returns_what_arrived() {
        let reply: &[u8] = &[0x55; 12];
        let data = read_data_stage(reply, 512).await.unwrap();
        assert_eq!(data.len(), 12);
    }

    #[tokio::test]
    async fn data_stage_never_reads_past_the_announced_length() {
        let mut stream: &[u8] = &[1, 2, 3, 4, 5, 6];
        let data = read_data_stage(&mut stream, 4).await.unwrap();
        assert_eq!(data, [1, 2, 3, 4]);
        // What follows belongs to the CSW.
        assert_eq!(stream, [5, 6]);
    }
}
