//! IOCTL bodies, as far as the front end needs them: the envelope and the
//! validate-negotiate-info FSCTL payloads.

use super::guid::Guid;
use super::header::HEADER_SIZE;
use super::negotiate::{GlobalCapabilities, NegotiateSecurityMode};
use super::wire::{Reader, WireError, Writer};

pub const FSCTL_VALIDATE_NEGOTIATE_INFO: u32 = 0x0014_0204;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlRequest {
    pub ctl_code: u32,
    pub file_id: [u8; 16],
    pub max_output_response: u32,
    pub flags: u32,
    pub input: Vec<u8>,
}

impl IoctlRequest {
    pub fn read(reader: &mut Reader) -> Self {
        reader.expect_u16(57);
        reader.skip(2); // reserved
        let ctl_code = reader.read_u32();
        let file_id = reader.read_array::<16>();
        let input_offset = reader.read_u32();
        let input_count = reader.read_u32();
        reader.skip(4); // max input response
        reader.skip(4); // output offset
        reader.skip(4); // output count
        let max_output_response = reader.read_u32();
        let flags = reader.read_u32();
        reader.skip(4); // reserved2

        let mut input = Vec::new();
        if input_count > 0 {
            if (input_offset as usize) < HEADER_SIZE {
                reader.fail(WireError::OutOfBounds {
                    target: input_offset as usize,
                    len: HEADER_SIZE,
                });
            } else {
                reader.seek(input_offset as usize - HEADER_SIZE);
                input = reader.read_bytes(input_count as usize).to_vec();
            }
        }

        IoctlRequest {
            ctl_code,
            file_id,
            max_output_response,
            flags,
            input,
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u16(57);
        writer.put_u16(0); // reserved
        writer.put_u32(self.ctl_code);
        writer.put_bytes(&self.file_id);
        let input_offset_at = writer.reserve_u32();
        writer.put_u32(self.input.len() as u32);
        writer.put_u32(0); // max input response
        writer.put_u32(0); // output offset
        writer.put_u32(0); // output count
        writer.put_u32(self.max_output_response);
        writer.put_u32(self.flags);
        writer.put_u32(0); // reserved2
        if !self.input.is_empty() {
            writer.patch_u32(input_offset_at, (writer.pos() + HEADER_SIZE) as u32);
            writer.put_bytes(&self.input);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlResponse {
    pub ctl_code: u32,
    pub file_id: [u8; 16],
    pub output: Vec<u8>,
}

impl IoctlResponse {
    pub fn read(reader: &mut Reader) -> Self {
        reader.expect_u16(49);
        reader.skip(2); // reserved
        let ctl_code = reader.read_u32();
        let file_id = reader.read_array::<16>();
        reader.skip(4); // input offset
        reader.skip(4); // input count
        let output_offset = reader.read_u32();
        let output_count = reader.read_u32();
        reader.skip(4); // flags
        reader.skip(4); // reserved2

        let mut output = Vec::new();
        if output_count > 0 {
            if (output_offset as usize) < HEADER_SIZE {
                reader.fail(WireError::OutOfBounds {
                    target: output_offset as usize,
                    len: HEADER_SIZE,
                });
            } else {
                reader.seek(output_offset as usize - HEADER_SIZE);
                output = reader.read_bytes(output_count as usize).to_vec();
            }
        }

        IoctlResponse {
            ctl_code,
            file_id,
            output,
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u16(49);
        writer.put_u16(0); // reserved
        writer.put_u32(self.ctl_code);
        writer.put_bytes(&self.file_id);
        writer.put_u32(0); // input offset
        writer.put_u32(0); // input count
        let output_offset_at = writer.reserve_u32();
        writer.put_u32(self.output.len() as u32);
        writer.put_u32(0); // flags
        writer.put_u32(0); // reserved2
        if !self.output.is_empty() {
            writer.patch_u32(output_offset_at, (writer.pos() + HEADER_SIZE) as u32);
            writer.put_bytes(&self.output);
        }
    }
}

/// The client's echoed view of the original negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateNegotiateInfoRequest {
    pub capabilities: GlobalCapabilities,
    pub client_guid: Guid,
    pub security_mode: NegotiateSecurityMode,
    pub dialects: Vec<u16>,
}

impl ValidateNegotiateInfoRequest {
    pub fn read(reader: &mut Reader) -> Self {
        let capabilities = GlobalCapabilities::from_bytes(reader.read_u32().to_le_bytes());
        let client_guid = Guid::read(reader);
        let security_mode = NegotiateSecurityMode::from_bytes(reader.read_u16().to_le_bytes());
        let dialect_count = reader.read_u16();
        let dialects = (0..dialect_count).map(|_| reader.read_u16()).collect();
        ValidateNegotiateInfoRequest {
            capabilities,
            client_guid,
            security_mode,
            dialects,
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u32(u32::from_le_bytes(self.capabilities.into_bytes()));
        self.client_guid.write(writer);
        writer.put_u16(u16::from_le_bytes(self.security_mode.into_bytes()));
        writer.put_u16(self.dialects.len() as u16);
        for dialect in &self.dialects {
            writer.put_u16(*dialect);
        }
    }
}

/// The server's authoritative answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateNegotiateInfoResponse {
    pub capabilities: GlobalCapabilities,
    pub server_guid: Guid,
    pub security_mode: NegotiateSecurityMode,
    pub dialect: u16,
}

impl ValidateNegotiateInfoResponse {
    pub fn read(reader: &mut Reader) -> Self {
        let capabilities = GlobalCapabilities::from_bytes(reader.read_u32().to_le_bytes());
        let server_guid = Guid::read(reader);
        let security_mode = NegotiateSecurityMode::from_bytes(reader.read_u16().to_le_bytes());
        let dialect = reader.read_u16();
        ValidateNegotiateInfoResponse {
            capabilities,
            server_guid,
            security_mode,
            dialect,
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u32(u32::from_le_bytes(self.capabilities.into_bytes()));
        self.server_guid.write(writer);
        writer.put_u16(u16::from_le_bytes(self.security_mode.into_bytes()));
        writer.put_u16(self.dialect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_request_round_trip() {
        let request = IoctlRequest {
            ctl_code: FSCTL_VALIDATE_NEGOTIATE_INFO,
            file_id: [0xff; 16],
            max_output_response: 24,
            flags: 0x01, // FSCTL passthrough
            input: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        let mut w = Writer::new();
        request.write(&mut w);
        let bytes = w.finish().unwrap();
        let mut r = Reader::new(&bytes);
        let parsed = IoctlRequest::read(&mut r);
        assert!(r.finish().is_ok());
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_validate_negotiate_round_trip() {
        let info = ValidateNegotiateInfoRequest {
            capabilities: GlobalCapabilities::new().with_leasing(true),
            client_guid: Guid::from([3u8; 16]),
            security_mode: NegotiateSecurityMode::new().with_signing_enabled(true),
            dialects: vec![0x0202, 0x0300],
        };
        let mut w = Writer::new();
        info.write(&mut w);
        let bytes = w.finish().unwrap();
        let mut r = Reader::new(&bytes);
        let parsed = ValidateNegotiateInfoRequest::read(&mut r);
        assert!(r.finish().is_ok());
        assert_eq!(parsed, info);
    }
}
