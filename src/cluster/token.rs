//! Network tokens: a tenant operation's claim on a network's VLAN

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::vlan::VlanTag;
use crate::backend::Account;

/// Immutable once minted; the caller owns it until release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkToken {
    pub id: Uuid,
    pub cluster: String,
    pub account: Account,
    pub network_name: String,
    pub network_uuid: String,
    pub vlan: VlanTag,
    pub created_at: DateTime<Utc>,
}

impl NetworkToken {
    pub fn new(
        cluster: impl Into<String>,
        account: Account,
        network_name: impl Into<String>,
        network_uuid: impl Into<String>,
        vlan: VlanTag,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster: cluster.into(),
            account,
            network_name: network_name.into(),
            network_uuid: network_uuid.into(),
            vlan,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Display for NetworkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NetworkToken [cluster={}, account={}, network={}, uuid={}, vlan={}, id={}]",
            self.cluster, self.account.name, self.network_name, self.network_uuid, self.vlan, self.id
        )
    }
}
