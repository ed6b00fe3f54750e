use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Credit account identifier.
    AccountId
);
string_id!(
    /// Credit lot identifier.
    LotId
);
string_id!(
    /// Reservation identifier.
    ReservationId
);
string_id!(
    /// Ledger entry identifier.
    EntryId
);
string_id!(
    /// Peer transfer identifier.
    TransferId
);
string_id!(
    /// Revenue rule identifier.
    RuleId
);
string_id!(
    /// Agent governance proposal identifier.
    ProposalId
);
string_id!(
    /// Economic event identifier.
    EventId
);
string_id!(
    /// Reconciliation run identifier.
    RunId
);

/// Identity of an agent principal acting on governance surfaces.
///
/// Agents are external, semi-trusted callers; their identifiers are assigned
/// by the surrounding platform, never generated here.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
