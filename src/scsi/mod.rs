//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe every command we need. The backdoor
//!   tunnel itself lives in the vendor-specific opcode range.

pub mod command;
mod command_descriptor;
pub mod response;

use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::usb::USBDrive;
use response::{Inquiry, Response};

/// An abstraction over an underlying USB
/// mass storage device.
///
/// Commands are defined in the `command` module, and
/// issued to the device with the `.issue_command` method.
pub struct SCSIDevice {
    drive: USBDrive,
    inquiry: Option<Inquiry>,
}

impl SCSIDevice {
    /// Performs SCSI initialization on the drive,
    /// and returns a new [`SCSIDevice`].
    ///
    /// This initialization sequence follows the order
    /// described here: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>.
    /// They are not formally documented anywhere, so the author reverse engineered from various OS implementatations.
    pub async fn new(drive: USBDrive) -> Result<Self> {
        info!("starting device configuration");
        let mut device = Self {
            drive,
            inquiry: None,
        };
        // An optical drive with no disc answers TEST UNIT READY with CHECK CONDITION,
        // which is not a reason to give up on the backdoor.
        debug!("submitting TEST UNIT READY");
        if let Err(e) = device.issue_command(&command::test_unit_ready(), &[]).await {
            warn!("TEST UNIT READY failed: {e}");
        }

        debug!("submitting INQUIRY");
        let data = device.issue_command(&command::inquiry(), &[]).await?;
        if let Response::Inquiry(inquiry) = response::inquiry_response(&data)? {
            info!(
                vendor = %inquiry.vendor,
                product = %inquiry.product,
                revision = %inquiry.revision,
                "drive identified"
            );
            device.inquiry = Some(inquiry);
        }

        debug!("submitting PREVENT ALLOW MEDIUM REMOVAL");
        // According to the reference blog post, the result can be ignored, and many
        // drives do not support this command, but it's submitted anyway to mimic other
        // operating systems.
        let _ = device
            .issue_command(&command::prevent_allow_medium_removal(), &[])
            .await;
        Ok(device)
    }

    /// Issues a command to the device.
    ///
    /// This function will submit the command to the device, wait for the
    /// response, and check it with the command's response parser.
    pub async fn issue_command(
        &mut self,
        command: &command::CommandBlock,
        data_out: &[u8],
    ) -> Result<Vec<u8>> {
        let response_bytes = self.drive.submit_cbw(command, data_out).await?;
        (command.response_parser)(&response_bytes)?;
        Ok(response_bytes)
    }

    /// Standard INQUIRY data captured during initialization.
    pub fn inquiry(&self) -> Option<&Inquiry> {
        self.inquiry.as_ref()
    }
}
