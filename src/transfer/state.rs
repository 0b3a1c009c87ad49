//! Transaction FSM State Definitions
//!
//! State IDs are stored as SMALLINT by the PostgreSQL store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transaction FSM States
///
/// ```text
/// INITIAL → PENDING → APPLIED → DONE
///              ↓         ↓
///              CANCELING ──→ CANCELED
/// ```
///
/// Terminal states: DONE (30), CANCELED (-20)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransactionState {
    /// Recorded, no account touched yet
    Initial = 0,

    /// Reserved: id is in both accounts' pending sets
    Pending = 10,

    /// Source debited and destination credited
    Applied = 20,

    /// Terminal: pending sets released, transfer complete
    Done = 30,

    /// Compensation in progress
    Canceling = -10,

    /// Terminal: compensation complete
    Canceled = -20,
}

impl TransactionState {
    /// Check if this is a terminal state (record is immutable)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Done | TransactionState::Canceled)
    }

    /// States whose amount counts toward a balance projection
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TransactionState::Pending | TransactionState::Applied)
    }

    /// States a transaction can be canceled from
    #[inline]
    pub fn is_cancelable(&self) -> bool {
        matches!(
            self,
            TransactionState::Pending | TransactionState::Applied | TransactionState::Canceling
        )
    }

    /// Forward-only transition table.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        match self {
            Initial => matches!(next, Pending),
            Pending => matches!(next, Applied | Canceling),
            Applied => matches!(next, Done | Canceling),
            Canceling => matches!(next, Canceled),
            Done | Canceled => false,
        }
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransactionState::Initial),
            10 => Some(TransactionState::Pending),
            20 => Some(TransactionState::Applied),
            30 => Some(TransactionState::Done),
            -10 => Some(TransactionState::Canceling),
            -20 => Some(TransactionState::Canceled),
            _ => None,
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Initial => "INITIAL",
            TransactionState::Pending => "PENDING",
            TransactionState::Applied => "APPLIED",
            TransactionState::Done => "DONE",
            TransactionState::Canceling => "CANCELING",
            TransactionState::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INITIAL" => Ok(TransactionState::Initial),
            "PENDING" => Ok(TransactionState::Pending),
            "APPLIED" => Ok(TransactionState::Applied),
            "DONE" => Ok(TransactionState::Done),
            "CANCELING" => Ok(TransactionState::Canceling),
            "CANCELED" => Ok(TransactionState::Canceled),
            other => Err(format!("unknown transaction state: {}", other)),
        }
    }
}

impl TryFrom<i16> for TransactionState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransactionState::from_id(value).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TransactionState; 6] = [
        TransactionState::Initial,
        TransactionState::Pending,
        TransactionState::Applied,
        TransactionState::Done,
        TransactionState::Canceling,
        TransactionState::Canceled,
    ];

    #[test]
    fn test_terminal_states() {
        assert!(TransactionState::Done.is_terminal());
        assert!(TransactionState::Canceled.is_terminal());

        assert!(!TransactionState::Initial.is_terminal());
        assert!(!TransactionState::Pending.is_terminal());
        assert!(!TransactionState::Applied.is_terminal());
        assert!(!TransactionState::Canceling.is_terminal());
    }

    #[test]
    fn test_in_flight_states() {
        assert!(TransactionState::Pending.is_in_flight());
        assert!(TransactionState::Applied.is_in_flight());

        assert!(!TransactionState::Initial.is_in_flight());
        assert!(!TransactionState::Canceling.is_in_flight());
        assert!(!TransactionState::Done.is_in_flight());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_happy_and_cancel_paths() {
        use TransactionState::*;
        assert!(Initial.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Applied));
        assert!(Applied.can_transition_to(Done));
        assert!(Pending.can_transition_to(Canceling));
        assert!(Applied.can_transition_to(Canceling));
        assert!(Canceling.can_transition_to(Canceled));

        assert!(!Initial.can_transition_to(Canceling));
        assert!(!Applied.can_transition_to(Pending));
        assert!(!Canceling.can_transition_to(Applied));
    }

    #[test]
    fn test_state_id_roundtrip() {
        for state in ALL {
            assert_eq!(TransactionState::from_id(state.id()), Some(state));
            assert_eq!(state.as_str().parse::<TransactionState>(), Ok(state));
        }
        assert!(TransactionState::from_id(999).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransactionState::Initial.to_string(), "INITIAL");
        assert_eq!(TransactionState::Canceled.to_string(), "CANCELED");
    }
}
