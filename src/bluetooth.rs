//! Routes HAL callbacks and profile transitions to the adapter, the profile aggregator and the
//! remote device registry, and publishes what they report.

use log::{debug, warn};
use num_traits::cast::FromPrimitive;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

use crate::adapter::AdapterState;
use crate::battery::{AtCommandType, VendorArg};
use crate::config::Config;
use crate::events::{Event, EventNotifier};
use crate::hal::{
    BtAclState, BtAdapterState, BtBondState, BtDiscoveryState, BtHal, BtProperty, BtPropertyType,
    HalCallbacks,
};
use crate::profile_connection::{Profile, ProfileConnectionAggregator, ProfileConnectionState};
use crate::remote_devices::RemoteDeviceRegistry;
use crate::{Message, RawAddress};

/// Owner of the adapter model. One per adapter.
pub struct Bluetooth {
    adapter: Arc<AdapterState>,
    profiles: ProfileConnectionAggregator,
    devices: RemoteDeviceRegistry,
    notifier: Arc<dyn EventNotifier + Send + Sync>,
}

impl Bluetooth {
    /// `tx` feeds the dispatch loop that will drive this instance; delayed work posts into it.
    pub fn new(
        tx: Sender<Message>,
        hal: Arc<dyn BtHal + Send + Sync>,
        notifier: Arc<dyn EventNotifier + Send + Sync>,
        config: &Config,
    ) -> Bluetooth {
        let adapter = Arc::new(AdapterState::new(hal.clone()));
        Bluetooth {
            profiles: ProfileConnectionAggregator::new(adapter.clone()),
            devices: RemoteDeviceRegistry::new(adapter.clone(), hal, tx, config),
            adapter,
            notifier,
        }
    }

    pub fn adapter(&self) -> &Arc<AdapterState> {
        &self.adapter
    }

    pub fn profiles(&self) -> &ProfileConnectionAggregator {
        &self.profiles
    }

    pub fn devices(&self) -> &RemoteDeviceRegistry {
        &self.devices
    }

    fn publish<I: IntoIterator<Item = Event>>(&self, events: I) {
        for event in events {
            self.notifier.publish(event);
        }
    }

    pub fn dispatch_hal_callbacks(&self, cb: HalCallbacks) {
        match cb {
            HalCallbacks::AdapterState(state) => self.adapter_state_changed(state),
            HalCallbacks::AdapterProperties(properties) => {
                self.adapter_properties_changed(properties)
            }
            HalCallbacks::RemoteDeviceProperties(addr, properties) => {
                self.remote_device_properties_changed(addr, properties)
            }
            HalCallbacks::DeviceFound(addr) => self.device_found(addr),
            HalCallbacks::DiscoveryState(state) => self.discovery_state(state),
            HalCallbacks::BondState(addr, state) => self.bond_state(addr, state),
            HalCallbacks::AclState(addr, state) => self.acl_state(addr, state),
        }
    }

    /// The radio is up. Connection bookkeeping from the last power cycle is void.
    pub fn on_adapter_ready(&self) {
        self.profiles.reset();
        self.adapter.on_adapter_ready();
    }

    pub fn on_profile_connection_state_changed(
        &self,
        profile: Profile,
        device: RawAddress,
        prev: i32,
        state: i32,
    ) {
        if let Some(t) = self.profiles.record_transition(profile, device, prev, state) {
            self.publish(Some(Event::AdapterConnectionStateChanged {
                device: t.device,
                profile: t.profile,
                prev: t.prev,
                state: t.state,
            }));
        }

        if profile == Profile::Headset {
            if let Some(state) = ProfileConnectionState::from_i32(state) {
                self.publish(self.devices.on_headset_connection_state_changed(device, state));
            }
        }
    }

    pub fn on_hf_indicator_value_changed(&self, device: RawAddress, indicator_id: i32, value: i32) {
        self.publish(self.devices.on_hf_indicator_value_changed(device, indicator_id, value));
    }

    pub fn on_vendor_specific_headset_event(
        &self,
        device: RawAddress,
        command: &str,
        cmd_type: AtCommandType,
        args: &[VendorArg],
    ) {
        self.publish(self.devices.on_vendor_specific_headset_event(device, command, cmd_type, args));
    }

    pub fn fetch_uuids(&self, device: RawAddress) {
        self.devices.fetch_uuids(device);
    }

    pub fn update_uuids(&self, device: RawAddress) {
        self.publish(Some(self.devices.update_uuids(device)));
    }

    pub fn on_uuid_fallback(&self, device: RawAddress, token: u64) {
        self.publish(self.devices.on_uuid_fallback(device, token));
    }

    pub fn set_alias(&self, device: RawAddress, alias: &str) {
        self.publish(Some(self.devices.set_alias(device, alias)));
    }

    /// Moves the device record and the adapter's bonded set together so they never disagree
    /// once this returns.
    fn update_bond_state(&self, addr: RawAddress, state: BtBondState) {
        let prev = self.devices.set_bond_state(addr, state);
        self.adapter.update_bonded(addr, state);

        if prev != state {
            debug!("Bond state of {} {:?} -> {:?}", addr, prev, state);
            self.publish(Some(Event::DeviceBondStateChanged { address: addr, prev, state }));
        }
    }

    fn adapter_state_changed(&self, state: BtAdapterState) {
        self.adapter.set_state(state);
    }

    fn adapter_properties_changed(&self, properties: Vec<BtProperty>) {
        for prop in properties {
            self.publish(self.adapter.apply_property(&prop));

            if prop.prop_type == BtPropertyType::AdapterBondedDevices {
                match prop.as_addresses() {
                    Ok(addrs) => {
                        for addr in addrs {
                            self.update_bond_state(addr, BtBondState::Bonded);
                        }
                    }
                    Err(e) => warn!("Bad bonded device list: {}", e),
                }
            }
        }
    }

    fn remote_device_properties_changed(&self, addr: RawAddress, properties: Vec<BtProperty>) {
        if properties.is_empty() {
            warn!("No properties to update for {}", addr);
            return;
        }

        for prop in properties {
            self.publish(self.devices.apply_property(addr, &prop));
        }
    }

    fn device_found(&self, addr: RawAddress) {
        self.publish(self.devices.device_found(addr));
    }

    fn discovery_state(&self, state: BtDiscoveryState) {
        self.publish(Some(self.adapter.discovery_state_changed(state)));
    }

    fn bond_state(&self, addr: RawAddress, state: BtBondState) {
        self.update_bond_state(addr, state);
    }

    fn acl_state(&self, addr: RawAddress, state: BtAclState) {
        self.publish(self.devices.acl_state_changed(addr, state));
    }
}
