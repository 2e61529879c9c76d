//! Representations for responses to SCSI commands.

use color_eyre::eyre::ensure;

pub type ResponseParser = fn(&[u8]) -> color_eyre::Result<Response<'_>>;

pub enum Response<'a> {
    Inquiry(Inquiry),
    /// Unstructured payload, such as backdoor stream bytes.
    Raw(&'a [u8]),

    None,
}

pub fn no_response(buf: &[u8]) -> color_eyre::Result<Response<'_>> {
    ensure!(buf.is_empty(), "expected no data stage, got {} bytes", buf.len());
    Ok(Response::None)
}

pub fn raw_response(buf: &[u8]) -> color_eyre::Result<Response<'_>> {
    Ok(Response::Raw(buf))
}

pub fn inquiry_response(buf: &[u8]) -> color_eyre::Result<Response<'_>> {
    ensure!(
        buf.len() >= INQUIRY_LEN,
        "standard INQUIRY data is at least {INQUIRY_LEN} bytes, got {}",
        buf.len()
    );
    Ok(Response::Inquiry(Inquiry {
        peripheral_info: buf[0],
        vendor: ascii_field(&buf[8..16]),
        product: ascii_field(&buf[16..32]),
        revision: ascii_field(&buf[32..36]),
    }))
}

const INQUIRY_LEN: usize = 36;

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

/// Standard INQUIRY data (SPC-2 table 46), the fields we care about.
#[derive(Debug, Clone)]
pub struct Inquiry {
    /// Contains both the PERIPHERAL QUALIFIER (bits 7:5) and PERIPHERAL DEVICE TYPE
    /// (bits 4:0) fields.
    ///
    /// An optical drive reports device type 05h (CD/DVD device).
    pub peripheral_info: u8,
    /// `T10 VENDOR IDENTIFICATION`
    pub vendor: String,
    /// `PRODUCT IDENTIFICATION`
    pub product: String,
    /// `PRODUCT REVISION LEVEL`, which on these drives doubles as the firmware version.
    pub revision: String,
}

impl Inquiry {
    pub fn device_type(&self) -> u8 {
        self.peripheral_info & 0x1f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identification_strings() {
        let mut buf = [0x20u8; 36];
        buf[0] = 0x05;
        buf[8..14].copy_from_slice(b"TSSTco");
        buf[16..25].copy_from_slice(b"BD-RE  BH");
        buf[32..36].copy_from_slice(b"SB01");
        let Response::Inquiry(inquiry) = inquiry_response(&buf).unwrap() else {
            panic!("expected inquiry data");
        };
        assert_eq!(inquiry.device_type(), 5);
        assert_eq!(inquiry.vendor, "TSSTco");
        assert_eq!(inquiry.product, "BD-RE  BH");
        assert_eq!(inquiry.revision, "SB01");
    }

    #[test]
    fn short_inquiry_is_rejected() {
        assert!(inquiry_response(&[0; 10]).is_err());
        assert!(no_response(&[1]).is_err());
    }
}
