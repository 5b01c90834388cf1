//! Folds per-profile connection transitions into one adapter-wide connection state.
//!
//! The adapter counts as connected as soon as any profile is connected, and only counts as
//! disconnected again once no profile is connecting or connected.

use log::{debug, error, warn};
use num_traits::cast::FromPrimitive;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::adapter::AdapterState;
use crate::RawAddress;

/// Profiles that report connection transitions, with the framework's profile ids.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Profile {
    Headset = 1,
    A2dp = 2,
    InputDevice = 4,
    Pan = 5,
    Pbap = 6,
    Map = 9,
    Sap = 10,
    A2dpSink = 11,
    AvrcpController = 12,
    HeadsetClient = 16,
    PbapClient = 17,
    MapClient = 18,
    InputHost = 19,
}

/// Connection state as reported by a profile service.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ProfileConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

/// Adapter-wide connection state.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BtConnectionState {
    Disconnected = 0,
    Connecting,
    Connected,
    Disconnecting,
}

impl Default for BtConnectionState {
    fn default() -> Self {
        BtConnectionState::Disconnected
    }
}

impl From<ProfileConnectionState> for BtConnectionState {
    fn from(state: ProfileConnectionState) -> Self {
        match state {
            ProfileConnectionState::Disconnected => BtConnectionState::Disconnected,
            ProfileConnectionState::Connecting => BtConnectionState::Connecting,
            ProfileConnectionState::Connected => BtConnectionState::Connected,
            ProfileConnectionState::Disconnecting => BtConnectionState::Disconnecting,
        }
    }
}

/// An adapter-level connection change caused by one profile transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterConnectionTransition {
    pub device: RawAddress,
    pub profile: Profile,
    pub prev: BtConnectionState,
    pub state: BtConnectionState,
}

/// Whether `prev -> next` is a transition profiles are expected to make.
pub fn is_normal_transition(prev: ProfileConnectionState, next: ProfileConnectionState) -> bool {
    use ProfileConnectionState::*;
    match prev {
        Disconnected => next == Connecting,
        Connected => next == Disconnecting,
        Connecting | Disconnecting => next == Disconnected || next == Connected,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    connecting: u32,
    connected: u32,
    disconnecting: u32,
}

impl Counters {
    fn bucket(&mut self, state: ProfileConnectionState) -> Option<&mut u32> {
        match state {
            ProfileConnectionState::Connecting => Some(&mut self.connecting),
            ProfileConnectionState::Connected => Some(&mut self.connected),
            ProfileConnectionState::Disconnecting => Some(&mut self.disconnecting),
            ProfileConnectionState::Disconnected => None,
        }
    }

    /// Moves one profile from `prev`'s bucket into `state`'s and reports whether the adapter-wide
    /// state changes as a result.
    fn update_and_check(
        &mut self,
        state: ProfileConnectionState,
        prev: ProfileConnectionState,
    ) -> bool {
        if let Some(count) = self.bucket(prev) {
            if *count == 0 {
                error!("Profile counter for {:?} is already 0, not decrementing", prev);
            } else {
                *count -= 1;
            }
        }

        if let Some(count) = self.bucket(state) {
            *count += 1;
        }

        match state {
            ProfileConnectionState::Connecting => self.connected == 0 && self.connecting == 1,
            ProfileConnectionState::Connected => self.connected == 1,
            ProfileConnectionState::Disconnecting => {
                self.connected == 0 && self.disconnecting == 1
            }
            ProfileConnectionState::Disconnected => self.connected == 0 && self.connecting == 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProfileRecord {
    state: ProfileConnectionState,
    device_count: u32,
}

#[derive(Default)]
struct AggregatorState {
    counters: Counters,
    profiles: HashMap<Profile, ProfileRecord>,
}

impl AggregatorState {
    fn update_profile(
        &mut self,
        profile: Profile,
        state: ProfileConnectionState,
        prev: ProfileConnectionState,
    ) {
        let record = match self.profiles.get(&profile) {
            Some(record) => *record,
            None => {
                self.profiles.insert(profile, ProfileRecord { state, device_count: 1 });
                return;
            }
        };

        let updated = if state == record.state {
            Some(ProfileRecord { state, device_count: record.device_count + 1 })
        } else if state == ProfileConnectionState::Connected
            || (state == ProfileConnectionState::Connecting
                && record.state != ProfileConnectionState::Connected)
        {
            Some(ProfileRecord { state, device_count: 1 })
        } else if record.device_count == 1 && prev == record.state {
            Some(ProfileRecord { state, device_count: 1 })
        } else if record.device_count > 1 && prev == record.state {
            // Other devices still hold the profile up.
            let remembered = match record.state {
                ProfileConnectionState::Connected | ProfileConnectionState::Connecting => {
                    record.state
                }
                _ => state,
            };
            Some(ProfileRecord { state: remembered, device_count: record.device_count - 1 })
        } else {
            None
        };

        if let Some(updated) = updated {
            self.profiles.insert(profile, updated);
        }
    }
}

pub struct ProfileConnectionAggregator {
    adapter: Arc<AdapterState>,
    state: Mutex<AggregatorState>,
}

impl ProfileConnectionAggregator {
    pub fn new(adapter: Arc<AdapterState>) -> Self {
        ProfileConnectionAggregator { adapter, state: Mutex::new(AggregatorState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one profile transition, using the raw state values the profile reported.
    ///
    /// Returns the adapter-level transition when the aggregate changed. The new aggregate is
    /// already stored in `AdapterState` by then; publishing it is up to the caller.
    pub fn record_transition(
        &self,
        profile: Profile,
        device: RawAddress,
        prev: i32,
        state: i32,
    ) -> Option<AdapterConnectionTransition> {
        let (prev, state) = match (
            ProfileConnectionState::from_i32(prev),
            ProfileConnectionState::from_i32(state),
        ) {
            (Some(p), Some(s)) => (p, s),
            _ => {
                error!(
                    "Invalid connection state transition {} -> {} for {:?} on {}",
                    prev, state, profile, device
                );
                return None;
            }
        };

        debug!("Profile connection state change: {:?} {}: {:?} -> {:?}", profile, device, prev, state);
        let normal = is_normal_transition(prev, state);
        if !normal {
            warn!("Unexpected transition for {:?} on {}: {:?} -> {:?}", profile, device, prev, state);
        }

        let mut guard = self.state();
        guard.update_profile(profile, state, prev);

        if !guard.counters.update_and_check(state, prev) {
            return None;
        }

        let transition = AdapterConnectionTransition {
            device,
            profile,
            prev: prev.into(),
            state: state.into(),
        };
        self.adapter.set_connection_state(transition.state);
        debug!(
            "Adapter connection state change: {}: {:?} -> {:?}",
            device, transition.prev, transition.state
        );
        if !normal {
            warn!("Adapter connection state followed an unexpected transition from {:?}", profile);
        }

        Some(transition)
    }

    /// Updates the per-profile record only, leaving the adapter-wide counters alone.
    pub fn update_profile_connection_state(
        &self,
        profile: Profile,
        state: ProfileConnectionState,
        prev: ProfileConnectionState,
    ) {
        self.state().update_profile(profile, state, prev);
    }

    pub fn get_profile_connection_state(&self, profile: Profile) -> ProfileConnectionState {
        self.state()
            .profiles
            .get(&profile)
            .map(|r| r.state)
            .unwrap_or(ProfileConnectionState::Disconnected)
    }

    /// Number of devices holding `profile` in its recorded state.
    pub fn get_profile_device_count(&self, profile: Profile) -> u32 {
        self.state().profiles.get(&profile).map(|r| r.device_count).unwrap_or(0)
    }

    /// Forgets every profile and sets the adapter aggregate back to disconnected.
    pub fn reset(&self) {
        let mut guard = self.state();
        *guard = AggregatorState::default();
        self.adapter.set_connection_state(BtConnectionState::Disconnected);
    }
}
