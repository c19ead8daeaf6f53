//! Role hierarchy.
//!
//! Ranks form a total preorder: lower rank is more senior, and the three
//! manager roles share rank 6. A role manages another only when it is
//! strictly more senior, so siblings never manage each other.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    NationalAgent,
    RegionAgent,
    CityAgent,
    ZoneAgent,
    HotelDirector,
    HotelManager,
    RestaurantManager,
    BeveragesManager,
    Owner,
}

impl Role {
    pub const ALL: [Role; 10] = [
        Role::Admin,
        Role::NationalAgent,
        Role::RegionAgent,
        Role::CityAgent,
        Role::ZoneAgent,
        Role::HotelDirector,
        Role::HotelManager,
        Role::RestaurantManager,
        Role::BeveragesManager,
        Role::Owner,
    ];

    pub const fn rank(self) -> u8 {
        match self {
            Role::Admin => 0,
            Role::NationalAgent => 1,
            Role::RegionAgent => 2,
            Role::CityAgent => 3,
            Role::ZoneAgent => 4,
            Role::HotelDirector => 5,
            Role::HotelManager | Role::RestaurantManager | Role::BeveragesManager => 6,
            Role::Owner => 7,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::NationalAgent => "nationalAgent",
            Role::RegionAgent => "regionAgent",
            Role::CityAgent => "cityAgent",
            Role::ZoneAgent => "zoneAgent",
            Role::HotelDirector => "hotelDirector",
            Role::HotelManager => "hotelManager",
            Role::RestaurantManager => "restaurantManager",
            Role::BeveragesManager => "beveragesManager",
            Role::Owner => "owner",
        }
    }

    /// Exact, case-sensitive match against the deployed role names.
    pub fn parse(s: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|r| r.as_str() == s)
    }

    pub const fn can_manage(self, target: Role) -> bool {
        self.rank() < target.rank()
    }

    pub fn manageable(self) -> BTreeSet<Role> {
        Role::ALL
            .into_iter()
            .filter(|r| self.can_manage(*r))
            .collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rank of a role name, `None` for names outside the deployed table.
pub fn rank(role: &str) -> Option<u8> {
    Role::parse(role).map(Role::rank)
}

/// Whether `manager` may invite, assign or administer `target`.
/// Fails closed when either name is unknown.
pub fn can_manage(manager: &str, target: &str) -> bool {
    match (Role::parse(manager), Role::parse(target)) {
        (Some(m), Some(t)) => m.can_manage(t),
        _ => false,
    }
}

/// Roles strictly junior to `role`; empty when `role` is unknown.
pub fn manageable_roles(role: &str) -> BTreeSet<Role> {
    Role::parse(role).map(Role::manageable).unwrap_or_default()
}
