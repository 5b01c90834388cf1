//! Outbound notifications.

use tokio::sync::mpsc::UnboundedSender;

use crate::hal::{BtAclState, BtBondState, BtScanMode};
use crate::profile_connection::{BtConnectionState, Profile};
use crate::uuid::Uuid;
use crate::RawAddress;

/// Everything the engine publishes. Each variant carries the new value so listeners do not need
/// to query back.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    AdapterNameChanged(String),
    AdapterAddressChanged(RawAddress),
    AdapterClassChanged(u32),
    AdapterScanModeChanged(BtScanMode),
    AdapterConnectionStateChanged {
        device: RawAddress,
        profile: Profile,
        prev: BtConnectionState,
        state: BtConnectionState,
    },
    DiscoveryStarted,
    DiscoveryFinished,
    DeviceFound { address: RawAddress, name: Option<String>, class_of_device: u32, rssi: i8 },
    DeviceNameChanged { address: RawAddress, name: String },
    DeviceAliasChanged { address: RawAddress, alias: String },
    DeviceClassChanged { address: RawAddress, class_of_device: u32 },
    /// UUIDs learned for a device; empty if the fetch timed out without any cached data.
    DeviceUuidsResolved { address: RawAddress, uuids: Vec<Uuid> },
    /// `None` means the level is unknown.
    DeviceBatteryChanged { address: RawAddress, level: Option<u8> },
    DeviceBondStateChanged { address: RawAddress, prev: BtBondState, state: BtBondState },
    /// `ble_only` is set when the adapter is only up in BLE mode.
    AclStateChanged { address: RawAddress, state: BtAclState, ble_only: bool },
    PairingCancel(RawAddress),
}

/// The publishing side of whatever delivers events to listeners.
pub trait EventNotifier {
    fn publish(&self, event: Event);
}

/// Forwards events into a tokio channel.
pub struct ChannelNotifier {
    tx: UnboundedSender<Event>,
}

impl ChannelNotifier {
    pub fn new(tx: UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

impl EventNotifier for ChannelNotifier {
    fn publish(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            log::warn!("Event receiver is gone, dropping {:?}", e.0);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn channel_notifier_forwards() {
        let (tx, mut rx) = unbounded_channel();
        let notifier = ChannelNotifier::new(tx);
        notifier.publish(Event::DiscoveryStarted);
        assert_eq!(rx.try_recv().unwrap(), Event::DiscoveryStarted);
    }

    #[test]
    fn channel_notifier_survives_closed_receiver() {
        let (tx, rx) = unbounded_channel();
        drop(rx);
        ChannelNotifier::new(tx).publish(Event::DiscoveryFinished);
    }
}
