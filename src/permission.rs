//! Permission code catalog.
//!
//! Codes are flat integers. Each resource owns a block of four consecutive
//! codes (create, read, update, delete); the log only has read and delete,
//! and a handful of special codes sit outside the CRUD blocks. The catalog
//! changes by redeploy only.

use std::fmt;

pub type PermissionCode = u32;

pub const CREATE_USER: PermissionCode = 1001;
pub const READ_USER: PermissionCode = 1002;
pub const UPDATE_USER: PermissionCode = 1003;
pub const DELETE_USER: PermissionCode = 1004;

pub const READ_LOG: PermissionCode = 1601;
pub const DELETE_LOG: PermissionCode = 1602;

pub const MANAGE_PERMISSIONS: PermissionCode = 1701;
pub const ACCESS_REPORTS: PermissionCode = 1702;
pub const OVERRIDE_RESTRICTIONS: PermissionCode = 1703;
pub const SYSTEM_CONFIGURATION: PermissionCode = 1704;
pub const INVITE_USER: PermissionCode = 1705;

pub const CREATE_STAY: PermissionCode = 6001;
pub const READ_STAY: PermissionCode = 6002;
pub const UPDATE_STAY: PermissionCode = 6003;
pub const DELETE_STAY: PermissionCode = 6004;

pub const READ_INVOICE: PermissionCode = 7002;

pub const CREATE_ROOM: PermissionCode = 8001;
pub const READ_ROOM: PermissionCode = 8002;
pub const DELETE_ROOM: PermissionCode = 8004;

pub const CREATE_FOOD_ORDER: PermissionCode = 9101;

pub const CREATE_PRICE_PERIOD: PermissionCode = 9301;
pub const READ_PRICE_PERIOD: PermissionCode = 9302;
pub const UPDATE_PRICE_PERIOD: PermissionCode = 9303;
pub const DELETE_PRICE_PERIOD: PermissionCode = 9304;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    ManagePermissions,
    AccessReports,
    OverrideRestrictions,
    SystemConfiguration,
    InviteUser,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::ManagePermissions => "managePermissions",
            Action::AccessReports => "accessReports",
            Action::OverrideRestrictions => "overrideRestrictions",
            Action::SystemConfiguration => "systemConfiguration",
            Action::InviteUser => "inviteUser",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CRUD block: `base + 1` is create, `base + 4` is delete.
struct Block {
    resource: &'static str,
    base: PermissionCode,
}

const CRUD_BLOCKS: &[Block] = &[
    Block { resource: "User", base: 1000 },
    Block { resource: "Country", base: 2000 },
    Block { resource: "Region", base: 2100 },
    Block { resource: "City", base: 2200 },
    Block { resource: "Zone", base: 2300 },
    Block { resource: "Hotel", base: 4000 },
    Block { resource: "Client", base: 5000 },
    Block { resource: "Stay", base: 6000 },
    Block { resource: "Invoice", base: 7000 },
    Block { resource: "Room", base: 8000 },
    Block { resource: "Food", base: 9000 },
    Block { resource: "FoodOrder", base: 9100 },
    Block { resource: "Category", base: 9200 },
    Block { resource: "PricePeriod", base: 9300 },
];

const SPECIAL: &[(PermissionCode, &str, Action)] = &[
    (READ_LOG, "Log", Action::Read),
    (DELETE_LOG, "Log", Action::Delete),
    (MANAGE_PERMISSIONS, "System", Action::ManagePermissions),
    (ACCESS_REPORTS, "System", Action::AccessReports),
    (OVERRIDE_RESTRICTIONS, "System", Action::OverrideRestrictions),
    (SYSTEM_CONFIGURATION, "System", Action::SystemConfiguration),
    (INVITE_USER, "User", Action::InviteUser),
];

/// Resource and action a code unlocks, `None` outside the catalog.
pub fn lookup(code: PermissionCode) -> Option<(&'static str, Action)> {
    if let Some(&(_, resource, action)) = SPECIAL.iter().find(|(c, _, _)| *c == code) {
        return Some((resource, action));
    }
    let block = CRUD_BLOCKS.iter().find(|b| code > b.base && code <= b.base + 4)?;
    let action = match code - block.base {
        1 => Action::Create,
        2 => Action::Read,
        3 => Action::Update,
        _ => Action::Delete,
    };
    Some((block.resource, action))
}

pub fn is_known(code: PermissionCode) -> bool {
    lookup(code).is_some()
}

/// Every code in the catalog, ascending.
pub fn catalog() -> Vec<(PermissionCode, &'static str, Action)> {
    let mut all: Vec<_> = CRUD_BLOCKS
        .iter()
        .flat_map(|b| {
            [Action::Create, Action::Read, Action::Update, Action::Delete]
                .into_iter()
                .enumerate()
                .map(move |(i, a)| (b.base + i as PermissionCode + 1, b.resource, a))
        })
        .chain(SPECIAL.iter().copied())
        .collect();
    all.sort_by_key(|(code, _, _)| *code);
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn crud_blocks_are_consecutive() {
        assert_eq!(lookup(4001), Some(("Hotel", Action::Create)));
        assert_eq!(lookup(4002), Some(("Hotel", Action::Read)));
        assert_eq!(lookup(4003), Some(("Hotel", Action::Update)));
        assert_eq!(lookup(4004), Some(("Hotel", Action::Delete)));
        assert_eq!(lookup(CREATE_ROOM), Some(("Room", Action::Create)));
        assert_eq!(lookup(DELETE_ROOM), Some(("Room", Action::Delete)));
    }

    #[test]
    fn log_has_only_read_and_delete() {
        assert_eq!(lookup(1601), Some(("Log", Action::Read)));
        assert_eq!(lookup(1602), Some(("Log", Action::Delete)));
        assert_eq!(lookup(1600), None);
        assert_eq!(lookup(1603), None);
    }

    #[test]
    fn codes_outside_blocks_are_unknown() {
        assert!(!is_known(0));
        assert!(!is_known(4000));
        assert!(!is_known(4005));
        assert!(!is_known(u32::MAX));
    }

    #[test]
    fn codes_never_collide() {
        let all = catalog();
        let unique: HashSet<_> = all.iter().map(|(c, _, _)| *c).collect();
        assert_eq!(unique.len(), all.len());
        for (code, resource, action) in &all {
            assert_eq!(lookup(*code), Some((*resource, *action)));
        }
    }

    #[test]
    fn constants_are_in_catalog() {
        for code in [
            CREATE_USER, READ_USER, UPDATE_USER, DELETE_USER, INVITE_USER,
            MANAGE_PERMISSIONS, ACCESS_REPORTS, OVERRIDE_RESTRICTIONS, SYSTEM_CONFIGURATION,
            CREATE_STAY, READ_STAY, UPDATE_STAY, DELETE_STAY, READ_INVOICE,
            CREATE_PRICE_PERIOD, READ_PRICE_PERIOD, UPDATE_PRICE_PERIOD, DELETE_PRICE_PERIOD,
        ] {
            assert!(is_known(code), "{code}");
        }
    }
}
