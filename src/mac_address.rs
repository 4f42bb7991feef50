//! Bluetooth device address handling.
//!
//! A 6-byte address type that the rest of the bridge uses as device
//! identity, independent of the BLE backend in use.

use std::fmt;

/// A Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Upper-case hex digits without separators, e.g. `AABBCCDDEEFF`.
    ///
    /// This is the form embedded in gateway device names.
    pub fn compact(&self) -> String {
        self.octets(None)
    }

    fn octets(&self, separator: Option<char>) -> String {
        let mut out = String::with_capacity(17);
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0
                && let Some(separator) = separator
            {
                out.push(separator);
            }
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }
}

/// Colon-separated upper-case form, e.g. `AA:BB:CC:DD:EE:FF`, as reported in `mac_addr`.
impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.octets(Some(':')))
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<MacAddress> for bluer::Address {
    fn from(addr: MacAddress) -> Self {
        bluer::Address(addr.0)
    }
}
