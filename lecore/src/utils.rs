use core::fmt;

/// Creates a `Copy` enum backed by a primitive, where values without a named variant end up in a
/// catch-all `Unknown` variant instead of failing conversion.
///
/// Over-the-air fields like control opcodes and error codes are open-ended: a peer implementing a
/// newer Core version may send values we don't know, and those still have to be answered (eg. with
/// an `LL_UNKNOWN_RSP` citing the opcode). Adapted from smoltcp's macro of the same name.
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        $v:vis enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $( #[$enum_attr] )*
        #[derive(Copy, Clone, PartialEq, Eq)]
        $v enum $name {
            $(
              $( #[$variant_attr] )*
              $variant,
            )*
            /// A value with no named variant.
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant, )*
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value, )*
                    $name::Unknown(other) => other
                }
            }
        }
    }
}

/// `Debug`-formats a byte slice as hex octets, in transmission order.
#[derive(Copy, Clone)]
pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut first = true;
        for byte in self.0.as_ref() {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{:02x}", byte)?;
        }
        f.write_str("]")
    }
}

/// `Debug`-formats an integer in hex with a `0x` prefix.
#[derive(Copy, Clone)]
pub struct Hex<T>(pub T)
where
    T: fmt::LowerHex;

impl<T: fmt::LowerHex> fmt::Debug for Hex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum_with_unknown! {
        #[derive(Debug)]
        enum Sample(u8) {
            A = 1,
            B = 7,
        }
    }

    #[test]
    fn unknown_values_survive_conversion() {
        assert_eq!(Sample::from(7), Sample::B);
        assert_eq!(Sample::from(3), Sample::Unknown(3));
        assert_eq!(u8::from(Sample::Unknown(3)), 3);
        assert_eq!(u8::from(Sample::A), 1);
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(format!("{:?}", HexSlice(&[0x01u8, 0xab][..])), "[01 ab]");
        assert_eq!(format!("{:?}", Hex(0x8e89bed6u32)), "0x8e89bed6");
    }
}
