//! Capability predicates over the channel role lattice.

use ircultra_types::models::Role;

/// `false` for a missing membership: an unknown member holds no capability.
pub fn has_role_at_least(role: Option<Role>, min: Role) -> bool {
    role.map(|r| r >= min).unwrap_or(false)
}

/// The role a mode-style command grants: `op`/`voice` promote,
/// `deop`/`devoice` demote back to MEMBER.
pub fn role_from_mode(cmd: &str) -> Option<Role> {
    match cmd {
        "op" => Some(Role::Op),
        "deop" => Some(Role::Member),
        "voice" => Some(Role::Voice),
        "devoice" => Some(Role::Member),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_membership_has_no_capability() {
        assert!(!has_role_at_least(None, Role::Member));
    }

    #[test]
    fn lattice_comparisons() {
        assert!(has_role_at_least(Some(Role::Owner), Role::Op));
        assert!(has_role_at_least(Some(Role::Op), Role::Op));
        assert!(!has_role_at_least(Some(Role::Voice), Role::Op));
    }

    #[test]
    fn mode_commands_map_to_roles() {
        assert_eq!(role_from_mode("op"), Some(Role::Op));
        assert_eq!(role_from_mode("deop"), Some(Role::Member));
        assert_eq!(role_from_mode("voice"), Some(Role::Voice));
        assert_eq!(role_from_mode("devoice"), Some(Role::Member));
        assert_eq!(role_from_mode("ban"), None);
    }
}
