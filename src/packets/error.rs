//! The fixed error-response body that accompanies a failure status.

use super::wire::{Reader, Writer};

/// Minimal error body: structure size 9, no error contexts, one byte of
/// zero error data.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse;

impl ErrorResponse {
    pub fn read(reader: &mut Reader) -> Self {
        reader.expect_u16(9);
        reader.skip(1); // error context count
        reader.skip(1); // reserved
        reader.skip(4); // byte count
        reader.skip(1); // error data
        ErrorResponse
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u16(9);
        writer.put_u8(0); // error context count
        writer.put_u8(0); // reserved
        writer.put_u32(0); // byte count
        writer.put_u8(0); // error data
    }

    pub fn to_bytes() -> Vec<u8> {
        let mut writer = Writer::new();
        ErrorResponse.write(&mut writer);
        writer.finish().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_is_nine_bytes() {
        let bytes = ErrorResponse::to_bytes();
        assert_eq!(bytes.len(), 9);
        let mut r = Reader::new(&bytes);
        ErrorResponse::read(&mut r);
        assert!(r.finish().is_ok());
    }
}
