//! Action flags carried by every inbound fragment.
//!
//! Flags are stored as an 8-bit bitfield on the wire. Whatever order a sender
//! lists them in, a fragment is always evaluated in the fixed order produced
//! by [`ActionSet::plan`]: END, RESET, receive chunk, APPEND, INFERENCE.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};

/// A single directive attached to a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Concatenate the buffer into an assembled payload
    Append,
    /// Discard the buffer and start over
    Reset,
    /// Run the model against the assembled payload
    Inference,
    /// The assembled payload is compressed
    Compressed,
    /// Terminate the session
    End,
}

impl Action {
    /// Every action, in wire-bit order.
    pub const ALL: [Action; 5] = [
        Action::Append,
        Action::Reset,
        Action::Inference,
        Action::Compressed,
        Action::End,
    ];

    /// Bit used for this action in the wire bitmask.
    pub const fn bit(self) -> u8 {
        match self {
            Action::Append => 1 << 0,
            Action::Reset => 1 << 1,
            Action::Inference => 1 << 2,
            Action::Compressed => 1 << 3,
            Action::End => 1 << 4,
        }
    }

    /// Upper-case protocol name.
    pub fn name(self) -> &'static str {
        match self {
            Action::Append => "APPEND",
            Action::Reset => "RESET",
            Action::Inference => "INFERENCE",
            Action::Compressed => "COMPRESSED",
            Action::End => "END",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "APPEND" => Ok(Action::Append),
            "RESET" => Ok(Action::Reset),
            "INFERENCE" => Ok(Action::Inference),
            "COMPRESSED" => Ok(Action::Compressed),
            "END" => Ok(Action::End),
            other => Err(OffloadError::Protocol(format!("Unknown action: {other}"))),
        }
    }
}

/// Combinable set of [`Action`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ActionSet(u8);

impl ActionSet {
    /// Mask of every defined bit.
    pub const VALID_BITS: u8 = 0x1F;

    /// Empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from raw wire bits, rejecting undefined bits.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::VALID_BITS != 0 {
            return Err(OffloadError::Protocol(format!(
                "Undefined action bits: {:#04x}",
                bits & !Self::VALID_BITS
            )));
        }
        Ok(Self(bits))
    }

    /// Raw wire bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Builder-style insert.
    pub fn with(mut self, action: Action) -> Self {
        self.insert(action);
        self
    }

    /// Add an action.
    pub fn insert(&mut self, action: Action) {
        self.0 |= action.bit();
    }

    /// Remove an action.
    pub fn remove(&mut self, action: Action) {
        self.0 &= !action.bit();
    }

    /// Check membership.
    pub fn contains(self, action: Action) -> bool {
        self.0 & action.bit() != 0
    }

    /// No flags set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate set members in wire-bit order.
    pub fn iter(self) -> impl Iterator<Item = Action> {
        Action::ALL.into_iter().filter(move |a| self.contains(*a))
    }

    /// Ordered plan of work this fragment triggers.
    ///
    /// `End` short-circuits to a lone [`Step::Terminate`]. Otherwise the chunk
    /// is always received, after a reset and before assembly.
    pub fn plan(self) -> Vec<Step> {
        if self.contains(Action::End) {
            return vec![Step::Terminate];
        }
        let compressed = self.contains(Action::Compressed);
        let mut plan = Vec::with_capacity(4);
        if self.contains(Action::Reset) {
            plan.push(Step::Reset);
        }
        plan.push(Step::Receive);
        if self.contains(Action::Append) {
            plan.push(Step::Assemble { compressed });
        }
        if self.contains(Action::Inference) {
            plan.push(Step::Infer { compressed });
        }
        plan
    }
}

/// One unit of work derived from a fragment's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// End the session; nothing else on the fragment runs
    Terminate,
    /// Discard buffer and assembled payload
    Reset,
    /// Append the fragment's chunk to the buffer
    Receive,
    /// Concatenate the buffer, decompressing when flagged
    Assemble {
        /// `COMPRESSED` was set on the fragment
        compressed: bool,
    },
    /// Run the model against the assembled payload
    Infer {
        /// `COMPRESSED` was set on the fragment
        compressed: bool,
    },
}

impl FromIterator<Action> for ActionSet {
    fn from_iter<I: IntoIterator<Item = Action>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), ActionSet::with)
    }
}

impl From<Action> for ActionSet {
    fn from(action: Action) -> Self {
        Self::empty().with(action)
    }
}

impl fmt::Debug for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Action::name).collect();
        write!(f, "{}", names.join("|"))
    }
}

impl Serialize for ActionSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for ActionSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let actions = Vec::<Action>::deserialize(deserializer)?;
        Ok(actions.into_iter().collect())
    }
}
