use std::fmt::Display;

use rand::{rngs::OsRng, Rng};

use super::wire::{Reader, Writer};

/// Represents a standard, 16-byte GUID, stored in wire order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid([u8; 16]);

impl Guid {
    pub const ZERO: Guid = Guid([0; 16]);

    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill(&mut bytes);
        Guid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn read(reader: &mut Reader) -> Guid {
        Guid(reader.read_array::<16>())
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_bytes(&self.0);
    }
}

impl From<[u8; 16]> for Guid {
    fn from(value: [u8; 16]) -> Self {
        Guid(value)
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First three fields are little-endian on the wire, the rest is
        // printed byte by byte.
        let data1 = u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        let data2 = u16::from_le_bytes([self.0[4], self.0[5]]);
        let data3 = u16::from_le_bytes([self.0[6], self.0[7]]);
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            data1,
            data2,
            data3,
            self.0[8],
            self.0[9],
            self.0[10],
            self.0[11],
            self.0[12],
            self.0[13],
            self.0[14],
            self.0[15],
        )
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_GUID_BYTES: [u8; 16] = [
        0xf1, 0xad, 0x5e, 0x06, 0xaf, 0x6d, 0x43, 0x15, 0xb0, 0x4f, 0x10, 0xe6, 0x90, 0x84, 0xc9,
        0xae,
    ];
    const TEST_GUID_STR: &str = "065eadf1-6daf-1543-b04f-10e69084c9ae";

    #[test]
    fn test_guid_display() {
        assert_eq!(Guid::from(TEST_GUID_BYTES).to_string(), TEST_GUID_STR);
    }

    #[test]
    fn test_guid_wire_round_trip() {
        let mut r = Reader::new(&TEST_GUID_BYTES);
        let guid = Guid::read(&mut r);
        assert!(r.finish().is_ok());
        let mut w = Writer::new();
        guid.write(&mut w);
        assert_eq!(w.finish().unwrap(), TEST_GUID_BYTES);
    }

    #[test]
    fn test_generate_is_not_zero() {
        assert_ne!(Guid::generate(), Guid::ZERO);
    }
}
