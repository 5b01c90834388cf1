//! Types and traits at the HAL boundary.
//!
//! The HAL decodes raw `bt_property_t` buffers into `BtProperty` values and delivers them together
//! with the other adapter callbacks as `HalCallbacks`. Calls back into the HAL go through `BtHal`.

use num_traits::cast::{FromPrimitive, ToPrimitive};
use std::convert::TryInto;

use crate::error::PropertyError;
use crate::uuid::Uuid;
use crate::RawAddress;

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, PartialOrd, Hash)]
#[repr(u32)]
pub enum BtPropertyType {
    BdName = 0x1,
    BdAddr,
    Uuids,
    ClassOfDevice,
    TypeOfDevice,
    ServiceRecord,
    AdapterScanMode,
    AdapterBondedDevices,
    AdapterDiscoverableTimeout,
    RemoteFriendlyName,
    RemoteRssi,
    RemoteVersionInfo,
    LocalLeFeatures,
    LocalIoCaps,
    LocalIoCapsBle,
    DynamicAudioBuffer,

    Unknown = 0xFE,
    RemoteDeviceTimestamp = 0xFF,
}

impl From<u32> for BtPropertyType {
    fn from(item: u32) -> Self {
        BtPropertyType::from_u32(item).unwrap_or(BtPropertyType::Unknown)
    }
}

impl From<BtPropertyType> for u32 {
    fn from(item: BtPropertyType) -> Self {
        item.to_u32().unwrap_or(0)
    }
}

/// Lifecycle state of the local adapter, using the framework's numbering.
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum BtAdapterState {
    Off = 10,
    TurningOn = 11,
    On = 12,
    TurningOff = 13,
    BleTurningOn = 14,
    BleOn = 15,
    BleTurningOff = 16,
}

impl Default for BtAdapterState {
    fn default() -> Self {
        BtAdapterState::Off
    }
}

/// Scan mode in HAL encoding (`bt_scan_mode_t`).
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum BtScanMode {
    None = 0,
    Connectable,
    ConnectableDiscoverable,
}

impl Default for BtScanMode {
    fn default() -> Self {
        BtScanMode::None
    }
}

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum BtBondState {
    None = 0,
    Bonding,
    Bonded,
}

impl From<u32> for BtBondState {
    fn from(item: u32) -> Self {
        BtBondState::from_u32(item).unwrap_or(BtBondState::None)
    }
}

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum BtDeviceType {
    Unknown = 0,
    Bredr,
    Ble,
    Dual,
}

impl From<u32> for BtDeviceType {
    fn from(item: u32) -> Self {
        BtDeviceType::from_u32(item).unwrap_or(BtDeviceType::Unknown)
    }
}

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum BtDiscoveryState {
    Stopped = 0x0,
    Started,
}

impl From<u32> for BtDiscoveryState {
    fn from(item: u32) -> Self {
        BtDiscoveryState::from_u32(item).unwrap_or(BtDiscoveryState::Stopped)
    }
}

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum BtAclState {
    Connected = 0,
    Disconnected,
}

impl From<u32> for BtAclState {
    fn from(item: u32) -> Self {
        BtAclState::from_u32(item).unwrap_or(BtAclState::Disconnected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BtProperty {
    pub prop_type: BtPropertyType,
    pub val: Vec<u8>,
}

impl BtProperty {
    pub fn new(prop_type: BtPropertyType, val: Vec<u8>) -> Self {
        BtProperty { prop_type, val }
    }

    /// Builds a property holding a little-endian u32, the HAL encoding for integer properties.
    pub fn from_u32(prop_type: BtPropertyType, value: u32) -> Self {
        BtProperty { prop_type, val: value.to_le_bytes().to_vec() }
    }

    /// Reads the leading little-endian u32.
    pub fn as_u32(&self) -> Result<u32, PropertyError> {
        let bytes: [u8; 4] = self
            .val
            .get(0..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(PropertyError::TooShort {
                prop: self.prop_type,
                expected: 4,
                actual: self.val.len(),
            })?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.val).into_owned()
    }

    pub fn as_address(&self) -> Result<RawAddress, PropertyError> {
        RawAddress::from_bytes(&self.val).ok_or(PropertyError::BadLength {
            prop: self.prop_type,
            unit: RawAddress::LEN,
            actual: self.val.len(),
        })
    }

    /// Splits the value into 16-byte UUID blocks. A trailing partial block rejects the property.
    pub fn as_uuids(&self) -> Result<Vec<Uuid>, PropertyError> {
        if self.val.len() % Uuid::LEN != 0 {
            return Err(PropertyError::BadLength {
                prop: self.prop_type,
                unit: Uuid::LEN,
                actual: self.val.len(),
            });
        }

        let mut uuids: Vec<Uuid> = Vec::new();
        for chunk in self.val.chunks_exact(Uuid::LEN) {
            if let Some(uuid) = Uuid::from_bytes(chunk) {
                if !uuids.contains(&uuid) {
                    uuids.push(uuid);
                }
            }
        }
        Ok(uuids)
    }

    /// Splits the value into 6-byte addresses.
    pub fn as_addresses(&self) -> Result<Vec<RawAddress>, PropertyError> {
        if self.val.len() % RawAddress::LEN != 0 {
            return Err(PropertyError::BadLength {
                prop: self.prop_type,
                unit: RawAddress::LEN,
                actual: self.val.len(),
            });
        }

        Ok(self.val.chunks_exact(RawAddress::LEN).filter_map(RawAddress::from_bytes).collect())
    }
}

/// Callbacks delivered by the HAL, already converted from their C representation.
#[derive(Debug, Clone)]
pub enum HalCallbacks {
    AdapterState(BtAdapterState),
    AdapterProperties(Vec<BtProperty>),
    RemoteDeviceProperties(RawAddress, Vec<BtProperty>),
    DeviceFound(RawAddress),
    DiscoveryState(BtDiscoveryState),
    BondState(RawAddress, BtBondState),
    AclState(RawAddress, BtAclState),
}

/// Calls into the HAL. Every method returns whether the HAL accepted the request; results arrive
/// later as `HalCallbacks`.
pub trait BtHal {
    fn set_adapter_property(&self, prop: BtProperty) -> bool;

    fn set_remote_device_property(&self, addr: &RawAddress, prop: BtProperty) -> bool;

    /// Starts SDP (or GATT discovery) for the remote's services.
    fn get_remote_services(&self, addr: &RawAddress) -> bool;

    fn cancel_discovery(&self) -> bool;

    /// Continues the disable sequence once the radio confirmed scan mode none.
    fn disable(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Records every HAL call so tests can assert on them.
    #[derive(Default)]
    pub(crate) struct MockHal {
        pub adapter_props: Mutex<Vec<BtProperty>>,
        pub remote_props: Mutex<Vec<(RawAddress, BtProperty)>>,
        pub service_queries: Mutex<Vec<RawAddress>>,
        pub cancel_discovery_calls: Mutex<u32>,
        pub disable_calls: Mutex<u32>,
    }

    impl MockHal {
        pub(crate) fn requested_scan_modes(&self) -> Vec<u32> {
            self.adapter_props
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.prop_type == BtPropertyType::AdapterScanMode)
                .map(|p| p.as_u32().unwrap())
                .collect()
        }
    }

    impl BtHal for MockHal {
        fn set_adapter_property(&self, prop: BtProperty) -> bool {
            self.adapter_props.lock().unwrap().push(prop);
            true
        }

        fn set_remote_device_property(&self, addr: &RawAddress, prop: BtProperty) -> bool {
            self.remote_props.lock().unwrap().push((*addr, prop));
            true
        }

        fn get_remote_services(&self, addr: &RawAddress) -> bool {
            self.service_queries.lock().unwrap().push(*addr);
            true
        }

        fn cancel_discovery(&self) -> bool {
            *self.cancel_discovery_calls.lock().unwrap() += 1;
            true
        }

        fn disable(&self) -> bool {
            *self.disable_calls.lock().unwrap() += 1;
            true
        }
    }
}
