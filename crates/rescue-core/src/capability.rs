use std::fmt;

use serde::{Deserialize, Serialize};

/// A role a connection can claim for itself.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Receives SOS broadcasts and may send them.
    RescueTeam,
    /// Receives facility capacity broadcasts.
    MapSubscriber,
}

impl Capability {
    const fn bit(self) -> u8 {
        match self {
            Self::RescueTeam => 0b01,
            Self::MapSubscriber => 0b10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RescueTeam => "rescue_team",
            Self::MapSubscriber => "map_subscriber",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of capabilities held by one connection. Empty on admission.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn grant(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    #[must_use]
    pub fn with(mut self, cap: Capability) -> Self {
        self.grant(cap);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        [Capability::RescueTeam, Capability::MapSubscriber]
            .into_iter()
            .filter(|cap| self.contains(*cap))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl Serialize for Capabilities {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}
