//! Adapter and remote device state for the Bluetooth service.
//!
//! This crate folds HAL property callbacks and per-profile connection transitions into a model of
//! the local adapter and of every remote device it has seen, and publishes the resulting changes
//! as `events::Event`s. All inputs are funneled through one dispatch loop (`Stack::dispatch`).

#[macro_use]
extern crate num_derive;

pub mod adapter;
pub mod battery;
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod events;
pub mod hal;
pub mod logging;
pub mod profile_connection;
pub mod remote_devices;
pub mod uuid;

use log::{debug, info};
use std::convert::TryInto;
use std::fmt::{Debug, Display, Formatter, Result};
use std::sync::Arc;

use tokio::sync::mpsc::channel;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::battery::{AtCommandType, VendorArg};
use crate::bluetooth::Bluetooth;
use crate::hal::HalCallbacks;
use crate::profile_connection::Profile;

/// Represents a Bluetooth address.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawAddress {
    val: [u8; 6],
}

impl Debug for RawAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        Display::fmt(self, f)
    }
}

impl Display for RawAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_fmt(format_args!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.val[0], self.val[1], self.val[2], self.val[3], self.val[4], self.val[5]
        ))
    }
}

impl RawAddress {
    pub const LEN: usize = 6;

    /// Constructs a RawAddress from exactly 6 bytes.
    pub fn from_bytes(raw_addr: &[u8]) -> Option<RawAddress> {
        raw_addr.try_into().ok().map(|val| RawAddress { val })
    }

    pub fn from_string<S: Into<String>>(addr: S) -> Option<RawAddress> {
        let addr: String = addr.into();
        let s = addr.split(':').collect::<Vec<&str>>();

        if s.len() != Self::LEN {
            return None;
        }

        let mut raw: [u8; 6] = [0; 6];
        for (i, part) in s.iter().enumerate() {
            if part.len() != 2 {
                return None;
            }
            raw[i] = u8::from_str_radix(part, 16).ok()?;
        }

        Some(RawAddress { val: raw })
    }

    pub fn to_byte_arr(&self) -> [u8; 6] {
        self.val
    }
}

/// Message types that are sent to the stack main dispatch loop.
#[derive(Debug)]
pub enum Message {
    Hal(HalCallbacks),

    /// The adapter finished turning on.
    AdapterReady,
    DisableRequested,
    BleDisableRequested,

    /// A profile service reported `(profile, device, prev, new)` with raw state values.
    ProfileConnectionState(Profile, RawAddress, i32, i32),
    HfIndicatorValue(RawAddress, i32, i32),
    VendorSpecificHeadsetEvent(RawAddress, String, AtCommandType, Vec<VendorArg>),

    /// A delayed UUID notification came due. The token ties it to one fetch.
    UuidFallback(RawAddress, u64),
}

/// Umbrella class for the Bluetooth stack.
pub struct Stack {}

impl Stack {
    /// Creates an mpsc channel for passing messages to the main dispatch loop.
    pub fn create_channel() -> (Sender<Message>, Receiver<Message>) {
        channel::<Message>(100)
    }

    /// Runs the main dispatch loop.
    pub async fn dispatch(mut rx: Receiver<Message>, bluetooth: Arc<Bluetooth>) {
        loop {
            let m = match rx.recv().await {
                Some(m) => m,
                None => {
                    info!("Message dispatch loop quit");
                    break;
                }
            };

            debug!("Dispatching {:?}", m);
            match m {
                Message::Hal(cb) => {
                    bluetooth.dispatch_hal_callbacks(cb);
                }

                Message::AdapterReady => {
                    bluetooth.on_adapter_ready();
                }

                Message::DisableRequested => {
                    bluetooth.adapter().on_disable_requested();
                }

                Message::BleDisableRequested => {
                    bluetooth.adapter().on_ble_disable();
                }

                Message::ProfileConnectionState(profile, device, prev, state) => {
                    bluetooth.on_profile_connection_state_changed(profile, device, prev, state);
                }

                Message::HfIndicatorValue(device, id, value) => {
                    bluetooth.on_hf_indicator_value_changed(device, id, value);
                }

                Message::VendorSpecificHeadsetEvent(device, cmd, cmd_type, args) => {
                    bluetooth.on_vendor_specific_headset_event(device, &cmd, cmd_type, &args);
                }

                Message::UuidFallback(device, token) => {
                    bluetooth.on_uuid_fallback(device, token);
                }
            }
        }
    }
}
