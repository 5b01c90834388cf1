//! Local adapter properties (name, address, scan mode, LE features, bonded devices, ...).

use log::{debug, info, warn};
use num_traits::cast::{FromPrimitive, ToPrimitive};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::PropertyError;
use crate::events::Event;
use crate::hal::{
    BtAdapterState, BtBondState, BtDiscoveryState, BtHal, BtProperty, BtPropertyType, BtScanMode,
};
use crate::profile_connection::BtConnectionState;
use crate::uuid::{Uuid, UuidHelper};
use crate::RawAddress;

/// How long an inquiry runs when the stack does not say otherwise.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(12800);

/// Controller LE capabilities, decoded from `BtPropertyType::LocalLeFeatures`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeFeatures {
    pub version_supported: u16,
    pub adv_instances_supported: u8,
    pub rpa_offload_supported: bool,
    pub max_irk_list_size: u8,
    pub max_adv_filter_supported: u8,
    pub activity_energy_info_supported: bool,
    pub scan_result_storage_size: u16,
    pub total_trackable_advertisers: u16,
    pub extended_scan_support: bool,
    pub debug_logging_supported: bool,
    pub le_2m_phy_supported: bool,
    pub le_coded_phy_supported: bool,
    pub le_extended_advertising_supported: bool,
    pub le_periodic_advertising_supported: bool,
    pub le_maximum_advertising_data_length: u16,
}

impl LeFeatures {
    pub const LEN: usize = 20;

    /// Byte 2 is reserved. Trailing bytes beyond the known layout are ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, PropertyError> {
        if raw.len() < Self::LEN {
            return Err(PropertyError::TooShort {
                prop: BtPropertyType::LocalLeFeatures,
                expected: Self::LEN,
                actual: raw.len(),
            });
        }

        let u16_at = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let flag_at = |i: usize| raw[i] != 0;

        Ok(LeFeatures {
            version_supported: u16_at(0),
            adv_instances_supported: raw[3],
            rpa_offload_supported: flag_at(4),
            max_irk_list_size: raw[5],
            max_adv_filter_supported: raw[6],
            activity_energy_info_supported: flag_at(7),
            scan_result_storage_size: u16_at(8),
            total_trackable_advertisers: u16_at(10),
            extended_scan_support: flag_at(12),
            debug_logging_supported: flag_at(13),
            le_2m_phy_supported: flag_at(14),
            le_coded_phy_supported: flag_at(15),
            le_extended_advertising_supported: flag_at(16),
            le_periodic_advertising_supported: flag_at(17),
            le_maximum_advertising_data_length: u16_at(18),
        })
    }
}

#[derive(Default)]
struct AdapterProperties {
    name: String,
    address: Option<RawAddress>,
    class_of_device: u32,
    scan_mode: BtScanMode,
    discoverable_timeout: u32,
    uuids: Vec<Uuid>,
    state: BtAdapterState,
    connection_state: BtConnectionState,
    le_features: LeFeatures,
    bonded_devices: Vec<RawAddress>,
    discovering: bool,
    discovery_end: Option<Instant>,
    // Set by a disable request; consumed when the radio confirms the new scan mode.
    disabling: bool,
    // Default scan mode already applied during this power-on cycle.
    ready_applied: bool,
}

/// The local adapter. One instance lives for the whole service and is shared by the profile
/// connection aggregator and the remote device registry.
pub struct AdapterState {
    hal: Arc<dyn BtHal + Send + Sync>,
    props: Mutex<AdapterProperties>,
}

impl AdapterState {
    pub fn new(hal: Arc<dyn BtHal + Send + Sync>) -> AdapterState {
        AdapterState { hal, props: Mutex::new(AdapterProperties::default()) }
    }

    fn props(&self) -> MutexGuard<'_, AdapterProperties> {
        self.props.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one adapter property from the HAL and returns the event to publish, if any.
    ///
    /// Bonded devices are added to the bonded set here; the caller is responsible for moving the
    /// matching remote device records to `BtBondState::Bonded`.
    pub fn apply_property(&self, prop: &BtProperty) -> Option<Event> {
        debug!("Adapter property {:?} len={}", prop.prop_type, prop.val.len());

        let mut continue_disable = false;
        let event = {
            let mut props = self.props();
            match self.apply_locked(&mut props, prop, &mut continue_disable) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Dropping adapter property: {}", e);
                    None
                }
            }
        };

        if continue_disable {
            debug!("Scan mode confirmed while disabling, continuing disable");
            self.hal.disable();
        }

        event
    }

    fn apply_locked(
        &self,
        props: &mut AdapterProperties,
        prop: &BtProperty,
        continue_disable: &mut bool,
    ) -> Result<Option<Event>, PropertyError> {
        match prop.prop_type {
            BtPropertyType::BdName => {
                props.name = prop.as_string();
                debug!("Name is: {}", props.name);
                Ok(Some(Event::AdapterNameChanged(props.name.clone())))
            }
            BtPropertyType::BdAddr => {
                let address = prop.as_address()?;
                props.address = Some(address);
                debug!("Address is: {}", address);
                Ok(Some(Event::AdapterAddressChanged(address)))
            }
            BtPropertyType::ClassOfDevice => {
                props.class_of_device = prop.as_u32()?;
                debug!("Class of device: {:#08x}", props.class_of_device);
                Ok(Some(Event::AdapterClassChanged(props.class_of_device)))
            }
            BtPropertyType::AdapterScanMode => {
                let raw = prop.as_u32()?;
                let mode = BtScanMode::from_u32(raw)
                    .ok_or(PropertyError::InvalidValue { prop: prop.prop_type, value: raw })?;
                props.scan_mode = mode;
                debug!("Scan mode: {:?}", mode);
                if props.disabling {
                    props.disabling = false;
                    *continue_disable = true;
                }
                Ok(Some(Event::AdapterScanModeChanged(mode)))
            }
            BtPropertyType::Uuids => {
                props.uuids = prop.as_uuids()?;
                debug!("Local uuids: [{}]", UuidHelper::format_list(&props.uuids));
                Ok(None)
            }
            BtPropertyType::AdapterBondedDevices => {
                for address in prop.as_addresses()? {
                    if !props.bonded_devices.contains(&address) {
                        debug!("Adding bonded device: {}", address);
                        props.bonded_devices.push(address);
                    }
                }
                Ok(None)
            }
            BtPropertyType::AdapterDiscoverableTimeout => {
                props.discoverable_timeout = prop.as_u32()?;
                debug!("Discoverable timeout: {}", props.discoverable_timeout);
                Ok(None)
            }
            BtPropertyType::LocalLeFeatures => {
                props.le_features = LeFeatures::parse(&prop.val)?;
                info!("LE features updated from controller: {:?}", props.le_features);
                Ok(None)
            }
            other => {
                warn!("Adapter property {:?} not handled", other);
                Ok(None)
            }
        }
    }

    /// Seeds a sane scan mode the first time the radio comes up in this power cycle.
    pub fn on_adapter_ready(&self) {
        let (mode, timeout) = {
            let mut props = self.props();
            debug!("on_adapter_ready, state={:?}, scan_mode={:?}", props.state, props.scan_mode);

            if props.state != BtAdapterState::TurningOn || props.ready_applied {
                return;
            }
            props.ready_applied = true;

            if props.scan_mode != BtScanMode::None {
                return;
            }

            // The discoverable timeout arrives with the initial property dump, before this call.
            let mode = if props.discoverable_timeout != 0 {
                BtScanMode::Connectable
            } else {
                BtScanMode::ConnectableDiscoverable
            };
            (mode, props.discoverable_timeout)
        };

        self.set_scan_mode(mode);
        // Keeps the stored config up to date on the first boot after a flash.
        self.set_discoverable_timeout(timeout);
    }

    /// Starts the ON -> BLE_ON part of a disable. Scan mode goes to none so no new connections
    /// come in; the disable proceeds when the HAL confirms the scan mode.
    pub fn on_disable_requested(&self) {
        let turning_off = {
            let mut props = self.props();
            debug!("on_disable_requested, state={:?}", props.state);
            props.disabling = true;
            props.state == BtAdapterState::TurningOff
        };

        if turning_off {
            self.hal.cancel_discovery();
            self.set_scan_mode(BtScanMode::None);
        }
    }

    /// BLE_ON -> OFF. Makes sure nothing can connect while the radio goes down.
    pub fn on_ble_disable(&self) {
        if self.get_state() == BtAdapterState::BleTurningOff {
            debug!("on_ble_disable, clearing scan mode");
            self.set_scan_mode(BtScanMode::None);
        }
    }

    pub fn discovery_state_changed(&self, state: BtDiscoveryState) -> Event {
        let mut props = self.props();
        match state {
            BtDiscoveryState::Stopped => {
                props.discovering = false;
                props.discovery_end = Some(Instant::now());
                Event::DiscoveryFinished
            }
            BtDiscoveryState::Started => {
                props.discovering = true;
                props.discovery_end = Some(Instant::now() + DEFAULT_DISCOVERY_TIMEOUT);
                Event::DiscoveryStarted
            }
        }
    }

    /// Adds or removes `address` from the bonded set. Returns whether the set changed.
    pub(crate) fn update_bonded(&self, address: RawAddress, state: BtBondState) -> bool {
        let mut props = self.props();
        match state {
            BtBondState::Bonded if !props.bonded_devices.contains(&address) => {
                debug!("Adding bonded device: {}", address);
                props.bonded_devices.push(address);
                true
            }
            BtBondState::None => {
                let before = props.bonded_devices.len();
                props.bonded_devices.retain(|a| *a != address);
                if props.bonded_devices.len() == before {
                    debug!("Failed to remove device: {}", address);
                    false
                } else {
                    debug!("Removing bonded device: {}", address);
                    true
                }
            }
            _ => false,
        }
    }

    /// Only the profile connection aggregator writes this.
    pub(crate) fn set_connection_state(&self, state: BtConnectionState) {
        self.props().connection_state = state;
    }

    pub fn set_state(&self, state: BtAdapterState) {
        let mut props = self.props();
        debug!("Setting state to {:?}", state);
        if matches!(
            state,
            BtAdapterState::TurningOff | BtAdapterState::BleTurningOff | BtAdapterState::Off
        ) {
            props.ready_applied = false;
        }
        props.state = state;
    }

    pub fn set_name(&self, name: &str) -> bool {
        self.hal
            .set_adapter_property(BtProperty::new(BtPropertyType::BdName, name.as_bytes().to_vec()))
    }

    pub fn set_scan_mode(&self, mode: BtScanMode) -> bool {
        let raw = mode.to_u32().unwrap_or(0);
        self.hal.set_adapter_property(BtProperty::from_u32(BtPropertyType::AdapterScanMode, raw))
    }

    pub fn set_discoverable_timeout(&self, timeout: u32) -> bool {
        self.hal.set_adapter_property(BtProperty::from_u32(
            BtPropertyType::AdapterDiscoverableTimeout,
            timeout,
        ))
    }

    pub fn get_state(&self) -> BtAdapterState {
        self.props().state
    }

    pub fn get_name(&self) -> String {
        self.props().name.clone()
    }

    pub fn get_address(&self) -> Option<RawAddress> {
        self.props().address
    }

    pub fn get_class_of_device(&self) -> u32 {
        self.props().class_of_device
    }

    pub fn get_scan_mode(&self) -> BtScanMode {
        self.props().scan_mode
    }

    pub fn get_discoverable_timeout(&self) -> u32 {
        self.props().discoverable_timeout
    }

    pub fn get_uuids(&self) -> Vec<Uuid> {
        self.props().uuids.clone()
    }

    pub fn get_connection_state(&self) -> BtConnectionState {
        self.props().connection_state
    }

    pub fn get_le_features(&self) -> LeFeatures {
        self.props().le_features.clone()
    }

    pub fn get_bonded_devices(&self) -> Vec<RawAddress> {
        let bonded = self.props().bonded_devices.clone();
        debug!("get_bonded_devices: length={}", bonded.len());
        bonded
    }

    pub fn is_bonded(&self, address: &RawAddress) -> bool {
        self.props().bonded_devices.contains(address)
    }

    pub fn is_discovering(&self) -> bool {
        self.props().discovering
    }

    /// When the current discovery ends, or when the last one ended.
    pub fn discovery_end(&self) -> Option<Instant> {
        self.props().discovery_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mocks::MockHal;

    fn setup() -> (Arc<MockHal>, AdapterState) {
        let hal = Arc::new(MockHal::default());
        let adapter = AdapterState::new(hal.clone());
        (hal, adapter)
    }

    #[test]
    fn le_features_single_flag() {
        let mut raw = [0u8; 20];
        raw[14] = 1;
        let features = LeFeatures::parse(&raw).unwrap();
        assert!(features.le_2m_phy_supported);
        assert_eq!(features, LeFeatures { le_2m_phy_supported: true, ..Default::default() });
    }

    #[test]
    fn le_features_counts() {
        let raw = [
            0x01, 0x02, 0x00, 0x05, 0x01, 0x0c, 0x10, 0x00, 0x00, 0x04, 0x20, 0x00, 0x01, 0x00,
            0x00, 0x01, 0x01, 0x00, 0xfb, 0x06,
        ];
        let features = LeFeatures::parse(&raw).unwrap();
        assert_eq!(features.version_supported, 0x0201);
        assert_eq!(features.adv_instances_supported, 5);
        assert!(features.rpa_offload_supported);
        assert_eq!(features.max_irk_list_size, 12);
        assert_eq!(features.max_adv_filter_supported, 16);
        assert!(!features.activity_energy_info_supported);
        assert_eq!(features.scan_result_storage_size, 0x0400);
        assert_eq!(features.total_trackable_advertisers, 32);
        assert!(features.extended_scan_support);
        assert!(!features.debug_logging_supported);
        assert!(!features.le_2m_phy_supported);
        assert!(features.le_coded_phy_supported);
        assert!(features.le_extended_advertising_supported);
        assert!(!features.le_periodic_advertising_supported);
        assert_eq!(features.le_maximum_advertising_data_length, 1787);
    }

    #[test]
    fn short_le_features_left_unchanged() {
        let (_hal, adapter) = setup();
        let mut raw = vec![0u8; 20];
        raw[16] = 1;
        adapter.apply_property(&BtProperty::new(BtPropertyType::LocalLeFeatures, raw));
        assert!(adapter.get_le_features().le_extended_advertising_supported);

        let event =
            adapter.apply_property(&BtProperty::new(BtPropertyType::LocalLeFeatures, vec![0; 19]));
        assert_eq!(event, None);
        assert!(adapter.get_le_features().le_extended_advertising_supported);
    }

    #[test]
    fn name_and_address_publish() {
        let (_hal, adapter) = setup();
        let event = adapter
            .apply_property(&BtProperty::new(BtPropertyType::BdName, b"floss-dut".to_vec()));
        assert_eq!(event, Some(Event::AdapterNameChanged("floss-dut".to_string())));
        assert_eq!(adapter.get_name(), "floss-dut");

        let event = adapter
            .apply_property(&BtProperty::new(BtPropertyType::BdAddr, vec![1, 2, 3, 4, 5, 6]));
        let address = RawAddress::from_bytes(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(event, Some(Event::AdapterAddressChanged(address)));
        assert_eq!(adapter.get_address(), Some(address));

        let event =
            adapter.apply_property(&BtProperty::new(BtPropertyType::BdAddr, vec![1, 2, 3]));
        assert_eq!(event, None);
        assert_eq!(adapter.get_address(), Some(address));
    }

    #[test]
    fn short_class_left_unchanged() {
        let (_hal, adapter) = setup();
        adapter.apply_property(&BtProperty::from_u32(BtPropertyType::ClassOfDevice, 0x5a020c));
        assert_eq!(adapter.get_class_of_device(), 0x5a020c);

        let event =
            adapter.apply_property(&BtProperty::new(BtPropertyType::ClassOfDevice, vec![1]));
        assert_eq!(event, None);
        assert_eq!(adapter.get_class_of_device(), 0x5a020c);
    }

    #[test]
    fn scan_mode_from_hal() {
        let (_hal, adapter) = setup();
        let event =
            adapter.apply_property(&BtProperty::from_u32(BtPropertyType::AdapterScanMode, 2));
        assert_eq!(event, Some(Event::AdapterScanModeChanged(BtScanMode::ConnectableDiscoverable)));
        assert_eq!(adapter.get_scan_mode(), BtScanMode::ConnectableDiscoverable);

        let event =
            adapter.apply_property(&BtProperty::from_u32(BtPropertyType::AdapterScanMode, 7));
        assert_eq!(event, None);
        assert_eq!(adapter.get_scan_mode(), BtScanMode::ConnectableDiscoverable);
    }

    #[test]
    fn bonded_devices_property_fills_set_in_order() {
        let (_hal, adapter) = setup();
        adapter.apply_property(&BtProperty::new(
            BtPropertyType::AdapterBondedDevices,
            vec![6, 5, 4, 3, 2, 1, 1, 2, 3, 4, 5, 6, 6, 5, 4, 3, 2, 1],
        ));
        let bonded = adapter.get_bonded_devices();
        assert_eq!(bonded.len(), 2);
        assert_eq!(bonded[0].to_byte_arr(), [6, 5, 4, 3, 2, 1]);
        assert_eq!(bonded[1].to_byte_arr(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn ready_applies_default_scan_mode_once() {
        let (hal, adapter) = setup();
        adapter.apply_property(&BtProperty::from_u32(
            BtPropertyType::AdapterDiscoverableTimeout,
            120,
        ));
        adapter.set_state(BtAdapterState::TurningOn);

        adapter.on_adapter_ready();
        adapter.on_adapter_ready();
        assert_eq!(hal.requested_scan_modes(), vec![BtScanMode::Connectable as u32]);

        // Next power cycle applies it again.
        adapter.set_state(BtAdapterState::TurningOff);
        adapter.set_state(BtAdapterState::TurningOn);
        adapter.on_adapter_ready();
        assert_eq!(hal.requested_scan_modes().len(), 2);
    }

    #[test]
    fn ready_without_timeout_is_discoverable() {
        let (hal, adapter) = setup();
        adapter.set_state(BtAdapterState::TurningOn);
        adapter.on_adapter_ready();
        assert_eq!(hal.requested_scan_modes(), vec![BtScanMode::ConnectableDiscoverable as u32]);
    }

    #[test]
    fn ready_outside_turning_on_is_noop() {
        let (hal, adapter) = setup();
        adapter.set_state(BtAdapterState::On);
        adapter.on_adapter_ready();
        assert!(hal.adapter_props.lock().unwrap().is_empty());
    }

    #[test]
    fn disable_while_on_waits_for_scan_mode() {
        let (hal, adapter) = setup();
        adapter.set_state(BtAdapterState::On);
        adapter.on_disable_requested();
        assert!(hal.requested_scan_modes().is_empty());
        assert_eq!(*hal.disable_calls.lock().unwrap(), 0);

        adapter.apply_property(&BtProperty::from_u32(BtPropertyType::AdapterScanMode, 0));
        assert_eq!(*hal.disable_calls.lock().unwrap(), 1);

        // The latch is consumed.
        adapter.apply_property(&BtProperty::from_u32(BtPropertyType::AdapterScanMode, 1));
        assert_eq!(*hal.disable_calls.lock().unwrap(), 1);
    }

    #[test]
    fn disable_while_turning_off_clears_scan_mode() {
        let (hal, adapter) = setup();
        adapter.set_state(BtAdapterState::TurningOff);
        adapter.on_disable_requested();
        assert_eq!(*hal.cancel_discovery_calls.lock().unwrap(), 1);
        assert_eq!(hal.requested_scan_modes(), vec![BtScanMode::None as u32]);
    }

    #[test]
    fn ble_disable_clears_scan_mode() {
        let (hal, adapter) = setup();
        adapter.set_state(BtAdapterState::BleOn);
        adapter.on_ble_disable();
        assert!(hal.requested_scan_modes().is_empty());

        adapter.set_state(BtAdapterState::BleTurningOff);
        adapter.on_ble_disable();
        assert_eq!(hal.requested_scan_modes(), vec![BtScanMode::None as u32]);
    }

    #[test]
    fn discovery_state_tracking() {
        let (_hal, adapter) = setup();
        assert_eq!(adapter.discovery_state_changed(BtDiscoveryState::Started), Event::DiscoveryStarted);
        assert!(adapter.is_discovering());
        assert!(adapter.discovery_end().unwrap() > Instant::now());

        assert_eq!(
            adapter.discovery_state_changed(BtDiscoveryState::Stopped),
            Event::DiscoveryFinished
        );
        assert!(!adapter.is_discovering());
    }

    #[test]
    fn update_bonded_add_remove() {
        let (_hal, adapter) = setup();
        let address = RawAddress::from_bytes(&[1, 1, 1, 1, 1, 1]).unwrap();
        assert!(adapter.update_bonded(address, BtBondState::Bonded));
        assert!(!adapter.update_bonded(address, BtBondState::Bonded));
        assert!(adapter.is_bonded(&address));
        assert!(!adapter.update_bonded(address, BtBondState::Bonding));
        assert!(adapter.update_bonded(address, BtBondState::None));
        assert!(!adapter.is_bonded(&address));
        assert!(!adapter.update_bonded(address, BtBondState::None));
    }
}
