//! Message routing.
//!
//! Each inbound envelope is handled by a pure function of the sender's current
//! state. Handlers return an [`Outcome`] (the sender's next state, if changed,
//! plus the frames to emit) and never look at other connections; [`apply`]
//! writes the outcome back into the registry.

use rescue_core::envelope::kind;
use rescue_core::{Capability, ConnectionId, Inbound, Outbound, Payload, Position, RelayError};

use crate::registry::{Audience, ConnectionRegistry, ConnectionState};

/// Routing switches that are not part of the envelope.
#[derive(Clone, Copy, Debug)]
pub struct RouterOptions {
    /// Fan unrecognized envelopes out to every other connection. When off they
    /// are answered with an `ERROR` envelope.
    pub relay_unknown_types: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            relay_unknown_types: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Send to the originating connection only.
    Reply(Outbound),
    /// Send to every connection in `audience` except the sender.
    Broadcast { audience: Audience, message: Outbound },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outcome {
    pub state: Option<ConnectionState>,
    pub effects: Vec<Effect>,
}

impl Outcome {
    fn nothing() -> Self {
        Self::default()
    }

    fn reply(message: Outbound) -> Self {
        Self {
            state: None,
            effects: vec![Effect::Reply(message)],
        }
    }

    fn rejected(err: &RelayError) -> Self {
        Self::reply(Outbound::error(err))
    }

    fn broadcast(audience: Audience, message: Outbound) -> Self {
        Self {
            state: None,
            effects: vec![Effect::Broadcast { audience, message }],
        }
    }

    fn with_state(mut self, state: ConnectionState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Route one envelope from a connection in `state`.
pub fn handle(state: &ConnectionState, message: Inbound, options: RouterOptions) -> Outcome {
    match message {
        Inbound::JoinRescueTeam { user_id } => join_rescue_team(state, user_id),
        Inbound::JoinMapUpdates { location } => join_map_updates(state, location),
        Inbound::LocationUpdate {
            coordinates,
            is_sos,
            raw,
        } => location_update(state, coordinates, is_sos, raw),
        Inbound::SosLocationUpdate { coordinates, raw } => sos_location_update(state, coordinates, raw),
        Inbound::FacilityCapacityUpdate { raw } => {
            Outcome::broadcast(Audience::MapSubscribers, Outbound::retagged(raw, kind::FACILITY_UPDATE))
        }
        Inbound::Ping => Outcome::reply(Outbound::Pong),
        Inbound::Unrecognized { kind, raw } => unrecognized(kind, raw, options),
    }
}

fn require(state: &ConnectionState, cap: Capability) -> Result<(), RelayError> {
    if state.has(cap) {
        Ok(())
    } else {
        Err(RelayError::Unauthorized)
    }
}

fn join_rescue_team(state: &ConnectionState, user_id: Option<String>) -> Outcome {
    let Some(user_id) = user_id else {
        return Outcome::rejected(&RelayError::MissingUserId);
    };
    tracing::info!(user_id = %user_id, "rescue team member joined");

    let mut next = state.clone();
    next.capabilities.grant(Capability::RescueTeam);
    next.user_id = Some(user_id);
    Outcome::reply(Outbound::JoinSuccess).with_state(next)
}

fn join_map_updates(state: &ConnectionState, location: Option<Position>) -> Outcome {
    tracing::info!("map subscriber joined");

    let mut next = state.clone();
    next.capabilities.grant(Capability::MapSubscriber);
    next.location = location;
    Outcome::reply(Outbound::MapSubscriptionSuccess).with_state(next)
}

fn location_update(
    state: &ConnectionState,
    coordinates: Option<Position>,
    is_sos: bool,
    raw: Payload,
) -> Outcome {
    let Some(coordinates) = coordinates else {
        return Outcome::nothing();
    };
    let next = ConnectionState {
        location: Some(coordinates),
        ..state.clone()
    };
    if is_sos {
        // Relayed as sent; peers see the LOCATION_UPDATE tag and the isSOS flag.
        Outcome::broadcast(Audience::RescueTeam, Outbound::Relay(raw)).with_state(next)
    } else {
        Outcome::nothing().with_state(next)
    }
}

fn sos_location_update(
    state: &ConnectionState,
    coordinates: Option<Position>,
    raw: Payload,
) -> Outcome {
    if let Err(err) = require(state, Capability::RescueTeam) {
        return Outcome::rejected(&err);
    }
    if coordinates.is_none() {
        return Outcome::rejected(&RelayError::Unauthorized);
    }
    Outcome::broadcast(Audience::RescueTeam, Outbound::Relay(raw))
}

fn unrecognized(kind: String, raw: Payload, options: RouterOptions) -> Outcome {
    if options.relay_unknown_types {
        Outcome::broadcast(Audience::Everyone, Outbound::Relay(raw))
    } else {
        Outcome::rejected(&RelayError::UnknownType(kind))
    }
}

/// Frames queued by [`apply`], per broadcast audience.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub replied: bool,
    pub broadcasts: Vec<(Audience, usize)>,
}

/// Store the sender's new state and emit the outcome's frames.
pub fn apply(registry: &ConnectionRegistry, sender: &ConnectionId, outcome: Outcome) -> Delivery {
    let mut delivery = Delivery::default();
    if let Some(state) = outcome.state {
        registry.update_state(sender, state);
    }
    for effect in outcome.effects {
        match effect {
            Effect::Reply(message) => {
                delivery.replied |= registry.send_to(sender, message.to_text());
            }
            Effect::Broadcast { audience, message } => {
                let queued = registry.broadcast(audience, Some(sender), &message.to_text());
                delivery.broadcasts.push((audience, queued));
            }
        }
    }
    delivery
}
