//! Service UUIDs as reported by the HAL, and the profile UUIDs we know by name.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};

// List of profile uuids
pub const A2DP_SINK: &str = "0000110B-0000-1000-8000-00805F9B34FB";
pub const A2DP_SOURCE: &str = "0000110A-0000-1000-8000-00805F9B34FB";
pub const AVRCP_CONTROLLER: &str = "0000110E-0000-1000-8000-00805F9B34FB";
pub const AVRCP_TARGET: &str = "0000110C-0000-1000-8000-00805F9B34FB";
pub const BAS: &str = "0000180F-0000-1000-8000-00805F9B34FB";
pub const HSP: &str = "00001108-0000-1000-8000-00805F9B34FB";
pub const HSP_AG: &str = "00001112-0000-1000-8000-00805F9B34FB";
pub const HFP: &str = "0000111E-0000-1000-8000-00805F9B34FB";
pub const HFP_AG: &str = "0000111F-0000-1000-8000-00805F9B34FB";
pub const HID: &str = "00001124-0000-1000-8000-00805f9b34fb";
pub const HOGP: &str = "00001812-0000-1000-8000-00805f9b34fb";
pub const PANU: &str = "00001115-0000-1000-8000-00805F9B34FB";
pub const NAP: &str = "00001116-0000-1000-8000-00805F9B34FB";
pub const PBAP_PCE: &str = "0000112e-0000-1000-8000-00805F9B34FB";
pub const PBAP_PSE: &str = "0000112f-0000-1000-8000-00805F9B34FB";
pub const MAP: &str = "00001134-0000-1000-8000-00805F9B34FB";
pub const MAS: &str = "00001132-0000-1000-8000-00805F9B34FB";
pub const SAP: &str = "0000112D-0000-1000-8000-00805F9B34FB";

// Unsigned integer representation of the Bluetooth base UUID.
const BASE_UUID_NUM: u128 = 0x0000000000001000800000805f9b34fbu128;

/// A 128-bit UUID. Bytes are kept in the order the HAL delivers them, most significant first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    pub const LEN: usize = 16;

    /// Expands a 16 or 32-bit assigned number onto the base UUID.
    pub const fn from_short(val: u32) -> Self {
        Self((BASE_UUID_NUM + ((val as u128) << 96)).to_be_bytes())
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        raw.try_into().ok().map(Self)
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0
    }

    /// Parses the textual form `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`.
    pub fn from_string<S: Into<String>>(raw: S) -> Option<Self> {
        let raw: String = raw.into();
        let groups: Vec<&str> = raw.split('-').collect();
        if groups.len() != 5
            || groups.iter().map(|g| g.len()).collect::<Vec<usize>>() != [8, 4, 4, 4, 12]
        {
            return None;
        }

        let hex: String = groups.concat();
        u128::from_str_radix(&hex, 16).ok().map(|v| Self(v.to_be_bytes()))
    }

    /// Returns the 16-bit short form if this UUID sits on the base UUID.
    pub fn as_short(&self) -> Option<u16> {
        let value = u128::from_be_bytes(self.0);
        if value & ((1u128 << 96) - 1) == BASE_UUID_NUM {
            u16::try_from(value >> 96).ok()
        } else {
            None
        }
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let u = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-\
             {:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u[0], u[1], u[2], u[3], u[4], u[5], u[6], u[7], u[8], u[9], u[10], u[11], u[12],
            u[13], u[14], u[15]
        )
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match UuidHelper::known_profile(self) {
            Some(name) => write!(f, "{}: {}", self, name),
            None => Display::fmt(self, f),
        }
    }
}

lazy_static! {
    static ref PROFILES: HashMap<Uuid, &'static str> = [
        (A2DP_SINK, "A2dpSink"),
        (A2DP_SOURCE, "A2dpSource"),
        (AVRCP_CONTROLLER, "AvrcpController"),
        (AVRCP_TARGET, "AvrcpTarget"),
        (BAS, "Bas"),
        (HSP, "Hsp"),
        (HSP_AG, "HspAg"),
        (HFP, "Hfp"),
        (HFP_AG, "HfpAg"),
        (HID, "Hid"),
        (HOGP, "Hogp"),
        (PANU, "Panu"),
        (NAP, "Nap"),
        (PBAP_PCE, "PbapPce"),
        (PBAP_PSE, "PbapPse"),
        (MAP, "Map"),
        (MAS, "Mas"),
        (SAP, "Sap"),
    ]
    .iter()
    .filter_map(|(uuid, name)| Uuid::from_string(*uuid).map(|u| (u, *name)))
    .collect();
}

pub struct UuidHelper {}

impl UuidHelper {
    /// Name of the profile a UUID belongs to, if it is one we know.
    pub fn known_profile(uuid: &Uuid) -> Option<&'static str> {
        PROFILES.get(uuid).copied()
    }

    /// Renders a UUID list for logs.
    pub fn format_list(uuids: &[Uuid]) -> String {
        uuids.iter().map(|u| format!("{:?}", u)).collect::<Vec<String>>().join(", ")
    }
}
