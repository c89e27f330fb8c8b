//! The acting party, passed explicitly into every state-changing operation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn caregiver(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Caregiver,
        }
    }

    pub fn care_recipient(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::CareRecipient,
        }
    }

    pub fn agency_owner(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::AgencyOwner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caregiver,
    /// The care recipient or a family member acting on their behalf.
    CareRecipient,
    AgencyOwner,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Caregiver => "caregiver",
            Role::CareRecipient => "care_recipient",
            Role::AgencyOwner => "agency_owner",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caregiver" => Ok(Role::Caregiver),
            "care_recipient" => Ok(Role::CareRecipient),
            "agency_owner" => Ok(Role::AgencyOwner),
            _ => Err(crate::error::Error::Other(format!("unknown role: {s}"))),
        }
    }
}
