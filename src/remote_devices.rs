//! Cache of remote device properties.
//!
//! Records are created the first time any callback mentions an address and are only dropped by
//! eviction: once more than `max_device_queue_size` records exist the oldest one goes, unless it
//! is bonded, in which case it is kept and the cache stays over capacity.

use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

use crate::adapter::AdapterState;
use crate::battery::{self, AtCommandType, VendorArg};
use crate::config::Config;
use crate::error::PropertyError;
use crate::events::Event;
use crate::hal::{
    BtAclState, BtAdapterState, BtBondState, BtDeviceType, BtHal, BtProperty, BtPropertyType,
};
use crate::profile_connection::ProfileConnectionState;
use crate::uuid::{Uuid, UuidHelper};
use crate::{Message, RawAddress};

/// Major class "uncategorized", used until the remote reports its class.
pub const UNCATEGORIZED_CLASS_OF_DEVICE: u32 = 0x1F00;

/// HF indicator assigned number for the remote's battery level.
pub const HF_INDICATOR_BATTERY_LEVEL_STATUS: i32 = 2;

/// Snapshot of one remote device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProperties {
    pub address: RawAddress,
    pub name: Option<String>,
    pub alias: Option<String>,
    pub class_of_device: u32,
    pub rssi: i8,
    /// `None` until SDP (or a cached record) reports the device's services.
    pub uuids: Option<Vec<Uuid>>,
    pub device_type: BtDeviceType,
    pub bond_state: BtBondState,
    pub bonding_initiated_locally: bool,
    pub battery_level: Option<u8>,
    /// Open ACL links. A dual-mode device holds one per transport.
    pub acl_links: u8,
}

impl DeviceProperties {
    fn new(address: RawAddress) -> Self {
        DeviceProperties {
            address,
            name: None,
            alias: None,
            class_of_device: UNCATEGORIZED_CLASS_OF_DEVICE,
            rssi: 0,
            uuids: None,
            device_type: BtDeviceType::Unknown,
            bond_state: BtBondState::None,
            bonding_initiated_locally: false,
            battery_level: None,
            acl_links: 0,
        }
    }

    fn set_bond_state(&mut self, state: BtBondState) {
        self.bond_state = state;
        if state == BtBondState::None {
            // A stale list would let a re-pair connect before SDP completes.
            self.uuids = None;
            self.bonding_initiated_locally = false;
        }
    }

    fn merge_alias(&mut self, val: &[u8]) {
        let merged = match self.alias.take() {
            Some(old) if val.len() < old.len() => {
                // The kept tail starts on a char boundary so no character is split.
                let mut tail = val.len();
                while !old.is_char_boundary(tail) {
                    tail += 1;
                }
                let mut bytes = val.to_vec();
                bytes.extend_from_slice(&old.as_bytes()[tail..]);
                bytes
            }
            _ => val.to_vec(),
        };
        self.alias = Some(String::from_utf8_lossy(&merged).into_owned());
    }
}

struct PendingFetch {
    started: Instant,
    token: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    devices: HashMap<RawAddress, DeviceProperties>,
    // Insertion order, oldest first.
    queue: VecDeque<RawAddress>,
    sdp_tracker: HashMap<RawAddress, PendingFetch>,
    next_token: u64,
}

impl Registry {
    /// Forgets a pending fetch. Safe to call when there is none or its timer already fired.
    fn cancel_fetch(&mut self, address: &RawAddress) -> bool {
        match self.sdp_tracker.remove(address) {
            Some(pending) => {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                debug!(
                    "UUID fetch for {} done after {:?}",
                    address,
                    pending.started.elapsed()
                );
                true
            }
            None => false,
        }
    }

    fn uuids_of(&self, address: &RawAddress) -> Vec<Uuid> {
        self.devices.get(address).and_then(|d| d.uuids.clone()).unwrap_or_default()
    }
}

pub struct RemoteDeviceRegistry {
    adapter: Arc<AdapterState>,
    hal: Arc<dyn BtHal + Send + Sync>,
    tx: Sender<Message>,
    max_devices: usize,
    fallback_delay: Duration,
    registry: Mutex<Registry>,
}

impl RemoteDeviceRegistry {
    pub fn new(
        adapter: Arc<AdapterState>,
        hal: Arc<dyn BtHal + Send + Sync>,
        tx: Sender<Message>,
        config: &Config,
    ) -> Self {
        RemoteDeviceRegistry {
            adapter,
            hal,
            tx,
            max_devices: config.max_device_queue_size.max(1),
            fallback_delay: config.uuid_fallback_delay(),
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry<'a>(&self, reg: &'a mut Registry, address: RawAddress) -> &'a mut DeviceProperties {
        if !reg.devices.contains_key(&address) {
            debug!("Adding device {}", address);
            reg.devices.insert(address, DeviceProperties::new(address));
            reg.queue.push_back(address);

            if reg.queue.len() > self.max_devices {
                if let Some(oldest) = reg.queue.pop_front() {
                    if self.adapter.is_bonded(&oldest) {
                        debug!("Keeping bonded device {} over capacity", oldest);
                    } else {
                        debug!("Removing device {} from property map", oldest);
                        reg.devices.remove(&oldest);
                        reg.cancel_fetch(&oldest);
                    }
                }
            }
        }

        reg.devices.entry(address).or_insert_with(|| DeviceProperties::new(address))
    }

    /// Returns the record for `address`, creating it if needed.
    pub fn get_or_create(&self, address: RawAddress) -> DeviceProperties {
        let mut reg = self.registry();
        self.entry(&mut reg, address).clone()
    }

    pub fn get(&self, address: &RawAddress) -> Option<DeviceProperties> {
        self.registry().devices.get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.registry().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every record and every pending fetch.
    pub fn reset(&self) {
        let mut reg = self.registry();
        for (_, pending) in reg.sdp_tracker.drain() {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
        reg.devices.clear();
        reg.queue.clear();
    }

    /// Applies one remote property from the HAL and returns the event to publish, if any.
    pub fn apply_property(&self, address: RawAddress, prop: &BtProperty) -> Option<Event> {
        if prop.val.is_empty() {
            debug!("Ignoring empty {:?} for {}", prop.prop_type, address);
            return None;
        }

        let mut reg = self.registry();
        match self.apply_locked(&mut reg, address, prop) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping property for {}: {}", address, e);
                None
            }
        }
    }

    fn apply_locked(
        &self,
        reg: &mut Registry,
        address: RawAddress,
        prop: &BtProperty,
    ) -> Result<Option<Event>, PropertyError> {
        match prop.prop_type {
            BtPropertyType::BdName => {
                let name = prop.as_string();
                debug!("Remote device {} name is: {}", address, name);
                self.entry(reg, address).name = Some(name.clone());
                Ok(Some(Event::DeviceNameChanged { address, name }))
            }
            BtPropertyType::RemoteFriendlyName => {
                let device = self.entry(reg, address);
                device.merge_alias(&prop.val);
                debug!("Remote device {} alias is: {:?}", address, device.alias);
                Ok(None)
            }
            BtPropertyType::BdAddr => {
                let reported = prop.as_address()?;
                debug!("Remote address is: {}", reported);
                self.entry(reg, address);
                Ok(None)
            }
            BtPropertyType::ClassOfDevice => {
                let class_of_device = prop.as_u32()?;
                self.entry(reg, address).class_of_device = class_of_device;
                debug!("Remote class is: {:#06x}", class_of_device);
                Ok(Some(Event::DeviceClassChanged { address, class_of_device }))
            }
            BtPropertyType::Uuids => {
                let uuids = prop.as_uuids()?;
                debug!("Remote uuids for {}: [{}]", address, UuidHelper::format_list(&uuids));
                self.entry(reg, address).uuids = Some(uuids.clone());

                if self.adapter.get_state() != BtAdapterState::On {
                    return Ok(None);
                }
                reg.cancel_fetch(&address);
                Ok(Some(Event::DeviceUuidsResolved { address, uuids }))
            }
            BtPropertyType::TypeOfDevice => {
                let device_type = BtDeviceType::from(prop.as_u32()?);
                self.entry(reg, address).device_type = device_type;
                Ok(None)
            }
            BtPropertyType::RemoteRssi => {
                // The HAL reports RSSI in a single signed byte.
                self.entry(reg, address).rssi = prop.val[0] as i8;
                Ok(None)
            }
            other => {
                self.entry(reg, address);
                debug!("Remote property {:?} not handled", other);
                Ok(None)
            }
        }
    }

    /// Starts SDP for `address` unless a fetch is already pending. If SDP has not answered by the
    /// fallback delay, whatever UUIDs are cached get announced anyway.
    pub fn fetch_uuids(&self, address: RawAddress) {
        {
            let mut reg = self.registry();
            if reg.sdp_tracker.contains_key(&address) {
                debug!("UUID fetch for {} already pending", address);
                return;
            }

            reg.next_token = reg.next_token.wrapping_add(1);
            let token = reg.next_token;
            let timer = self.schedule_fallback(address, token);
            reg.sdp_tracker.insert(address, PendingFetch { started: Instant::now(), token, timer });
        }

        if !self.hal.get_remote_services(&address) {
            warn!("HAL refused to fetch services of {}", address);
        }
    }

    fn schedule_fallback(&self, address: RawAddress, token: u64) -> Option<JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("No runtime to schedule UUID fallback for {}: {}", address, e);
                return None;
            }
        };

        let tx = self.tx.clone();
        let delay = self.fallback_delay;
        Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(Message::UuidFallback(address, token)).await.is_err() {
                debug!("Dispatch loop gone, dropping UUID fallback for {}", address);
            }
        }))
    }

    /// Called from the dispatch loop when a fallback timer fires. Only the fetch that scheduled
    /// it is completed; late or superseded timers are ignored.
    pub fn on_uuid_fallback(&self, address: RawAddress, token: u64) -> Option<Event> {
        let mut reg = self.registry();
        match reg.sdp_tracker.get(&address) {
            Some(pending) if pending.token == token => {
                info!("No SDP answer from {} in time, sending cached UUIDs", address);
                reg.sdp_tracker.remove(&address);
                let uuids = reg.uuids_of(&address);
                Some(Event::DeviceUuidsResolved { address, uuids })
            }
            _ => {
                debug!("Stale UUID fallback for {}", address);
                None
            }
        }
    }

    /// Announces the cached UUIDs now, completing any pending fetch.
    pub fn update_uuids(&self, address: RawAddress) -> Event {
        let mut reg = self.registry();
        reg.cancel_fetch(&address);
        let uuids = reg.uuids_of(&address);
        Event::DeviceUuidsResolved { address, uuids }
    }

    pub fn is_fetch_pending(&self, address: &RawAddress) -> bool {
        self.registry().sdp_tracker.contains_key(address)
    }

    /// Stores a battery level in percent. Out of range values are dropped.
    pub fn update_battery_level(&self, address: RawAddress, level: i32) -> Option<Event> {
        let level = match u8::try_from(level) {
            Ok(level) if level <= 100 => level,
            _ => {
                warn!("Invalid battery level {} for {}", level, address);
                return None;
            }
        };

        let mut reg = self.registry();
        let device = self.entry(&mut reg, address);
        if device.battery_level == Some(level) {
            debug!("Same battery level {}% for {}", level, address);
            return None;
        }
        device.battery_level = Some(level);
        debug!("Updated {} battery level to {}%", address, level);
        Some(Event::DeviceBatteryChanged { address, level: Some(level) })
    }

    pub fn reset_battery_level(&self, address: RawAddress) -> Option<Event> {
        let mut reg = self.registry();
        let device = reg.devices.get_mut(&address)?;
        if device.battery_level.is_none() {
            debug!("Battery level of {} was never set or is already reset", address);
            return None;
        }
        device.battery_level = None;
        debug!("Reset battery level of {}", address);
        Some(Event::DeviceBatteryChanged { address, level: None })
    }

    pub fn on_hf_indicator_value_changed(
        &self,
        address: RawAddress,
        indicator_id: i32,
        value: i32,
    ) -> Option<Event> {
        if indicator_id != HF_INDICATOR_BATTERY_LEVEL_STATUS {
            return None;
        }
        self.update_battery_level(address, value)
    }

    pub fn on_vendor_specific_headset_event(
        &self,
        address: RawAddress,
        command: &str,
        cmd_type: AtCommandType,
        args: &[VendorArg],
    ) -> Option<Event> {
        if cmd_type != AtCommandType::Set {
            debug!("Only SET vendor commands are processed, got {:?} {}", cmd_type, command);
            return None;
        }

        let level = battery::battery_level_from_vendor_event(command, cmd_type, args)?;
        info!("{} reported battery level {}% via {}", address, level, command);
        self.update_battery_level(address, i32::try_from(level).ok()?)
    }

    /// Battery telemetry only comes over the headset link, so it goes stale once that drops.
    pub fn on_headset_connection_state_changed(
        &self,
        address: RawAddress,
        state: ProfileConnectionState,
    ) -> Option<Event> {
        if state != ProfileConnectionState::Disconnected {
            return None;
        }
        self.reset_battery_level(address)
    }

    /// Returns the previous bond state.
    pub fn set_bond_state(&self, address: RawAddress, state: BtBondState) -> BtBondState {
        let mut reg = self.registry();
        let device = self.entry(&mut reg, address);
        let prev = device.bond_state;
        device.set_bond_state(state);
        prev
    }

    pub fn set_bonding_initiated_locally(&self, address: RawAddress) {
        let mut reg = self.registry();
        self.entry(&mut reg, address).bonding_initiated_locally = true;
    }

    /// Sets a user-visible alias and writes it through to the HAL.
    pub fn set_alias(&self, address: RawAddress, alias: &str) -> Event {
        {
            let mut reg = self.registry();
            self.entry(&mut reg, address).alias = Some(alias.to_string());
        }

        let prop = BtProperty::new(BtPropertyType::RemoteFriendlyName, alias.as_bytes().to_vec());
        if !self.hal.set_remote_device_property(&address, prop) {
            warn!("HAL refused alias for {}", address);
        }
        Event::DeviceAliasChanged { address, alias: alias.to_string() }
    }

    /// Inquiry result. The properties arrive first, so the record is expected to exist.
    pub fn device_found(&self, address: RawAddress) -> Option<Event> {
        let reg = self.registry();
        match reg.devices.get(&address) {
            Some(device) => Some(Event::DeviceFound {
                address,
                name: device.name.clone(),
                class_of_device: device.class_of_device,
                rssi: device.rssi,
            }),
            None => {
                error!("Device found without properties: {}", address);
                None
            }
        }
    }

    pub fn acl_state_changed(&self, address: RawAddress, state: BtAclState) -> Vec<Event> {
        let (bond_state, acl_links) = {
            let mut reg = self.registry();
            let device = match reg.devices.get_mut(&address) {
                Some(device) => device,
                None => {
                    error!("ACL state change for unknown device {}: {:?}", address, state);
                    return vec![];
                }
            };
            device.acl_links = match state {
                BtAclState::Connected => device.acl_links.saturating_add(1),
                BtAclState::Disconnected => device.acl_links.saturating_sub(1),
            };
            (device.bond_state, device.acl_links)
        };

        let adapter_state = self.adapter.get_state();
        debug!("ACL {:?} for {}, adapter {:?}", state, address, adapter_state);

        let mut events = vec![];
        let ble_only = match state {
            BtAclState::Connected => match adapter_state {
                BtAdapterState::On | BtAdapterState::TurningOn => Some(false),
                BtAdapterState::BleOn | BtAdapterState::BleTurningOn => Some(true),
                _ => None,
            },
            BtAclState::Disconnected => {
                if bond_state == BtBondState::Bonding {
                    // Dismisses any dialog still asking to bond.
                    events.push(Event::PairingCancel(address));
                }
                match adapter_state {
                    BtAdapterState::On | BtAdapterState::TurningOff => Some(false),
                    BtAdapterState::BleOn | BtAdapterState::BleTurningOff => Some(true),
                    _ => None,
                }
            }
        };

        match ble_only {
            Some(ble_only) => events.push(Event::AclStateChanged { address, state, ble_only }),
            None => error!(
                "Not reporting ACL {:?} for {} in adapter state {:?}",
                state, address, adapter_state
            ),
        }

        // Battery telemetry survives until the last transport drops.
        if state == BtAclState::Disconnected && acl_links == 0 {
            events.extend(self.reset_battery_level(address));
        }

        events
    }
}
