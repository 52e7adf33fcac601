use {
    crate::{bytes::*, Error},
    core::fmt,
};

/// Specifies whether a device address is randomly generated or a public IEEE address.
///
/// Over the air, this is carried out of band in the `TxAdd`/`RxAdd` header bits.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AddressKind {
    Public,
    Random,
}

impl AddressKind {
    /// Returns the kind selected by a `TxAdd`/`RxAdd` header bit.
    pub fn from_header_bit(random: bool) -> Self {
        if random {
            AddressKind::Random
        } else {
            AddressKind::Public
        }
    }
}

/// A 48-bit Bluetooth device address.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    bytes: [u8; 6],
    kind: AddressKind,
}

impl DeviceAddress {
    /// Creates an address from its 6 octets in transmission order (least significant first).
    pub fn new(bytes: [u8; 6], kind: AddressKind) -> Self {
        DeviceAddress { bytes, kind }
    }

    /// Reads an address whose kind was taken from a PDU header bit.
    pub fn read(bytes: &mut ByteReader<'_>, random: bool) -> Result<Self, Error> {
        Ok(Self::new(
            bytes.read_array()?,
            AddressKind::from_header_bit(random),
        ))
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn is_random(&self) -> bool {
        self.kind == AddressKind::Random
    }

    /// Returns the address octets in transmission order.
    pub fn raw(&self) -> &[u8; 6] {
        &self.bytes
    }
}

impl ToBytes for DeviceAddress {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.bytes)
    }
}

/// Formats the address most significant octet first, the way it's usually written.
impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.bytes.iter().rev().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, " ({:?})", self.kind)
    }
}
