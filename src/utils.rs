use core::fmt;

/// Defines an enum over a wire-encoded code field, with a catch-all `Unknown` variant.
///
/// The proxy sits in a packet path it does not fully own: H4 packet types, HCI event codes,
/// boundary flags and signaling command codes all arrive carrying values the proxy has no
/// interest in, and those packets must pass through rather than be rejected. Every such code
/// field is therefore an enum built with this macro: decoding never fails, unassigned values are
/// preserved in `Unknown` and re-encode to the exact byte they came from.
macro_rules! wire_enum {
    (
        $( #[$enum_attr:meta] )*
        $v:vis enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr,
            )*
        }
    ) => {
        $( #[$enum_attr] )*
        $v enum $name {
            $(
              $( #[$variant_attr] )*
              $variant,
            )*
            /// A value this crate assigns no meaning to. Carried so the packet survives a
            /// decode/encode round trip unchanged.
            Unknown($ty),
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant, )*
                    other => $name::Unknown(other),
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value, )*
                    $name::Unknown(other) => other,
                }
            }
        }
    }
}

/// `Debug`-formats a byte slice as bare hex octets, the way packet bytes appear in logs.
#[derive(Copy, Clone)]
pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, byte) in self.0.as_ref().iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        f.write_str("]")
    }
}

/// `Debug`-formats a numeric field in hexadecimal.
///
/// Connection handles and CIDs are quoted in hex throughout the Bluetooth specifications, so log
/// lines do the same.
#[derive(Copy, Clone)]
pub struct Hex<T>(pub T)
where
    T: fmt::LowerHex;

impl<T: fmt::LowerHex> fmt::Debug for Hex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
