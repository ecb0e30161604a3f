//! Tenant capability checks.
//!
//! The control plane grants each principal a set of capability tags drawn
//! from a closed vocabulary. The tag strings are part of the external
//! protocol and keep their historical names: `edit-files` gates *reading*
//! and `save-files` gates *overwriting* an existing file.

/// Operations a principal can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Directory listings and stat calls.
    ListFiles,
    /// Opening files for reading. The tag name is legacy; it has never
    /// gated editing.
    EditFiles,
    /// Creating new files, directories, and symlinks.
    CreateFiles,
    /// Overwriting an existing file.
    SaveFiles,
    /// Renames.
    MoveFiles,
    /// Removing files and directories.
    DeleteFiles,
}

impl Capability {
    /// The wire tag for this capability, exactly as the control plane
    /// issues it.
    pub const fn tag(self) -> &'static str {
        match self {
            Capability::ListFiles => "list-files",
            Capability::EditFiles => "edit-files",
            Capability::CreateFiles => "create-files",
            Capability::SaveFiles => "save-files",
            Capability::MoveFiles => "move-files",
            Capability::DeleteFiles => "delete-files",
        }
    }
}

/// The capability tags granted to one session principal.
///
/// Owner and administrator accounts are issued the single-element wildcard
/// set `["*"]`, which passes every check without consulting the tags.
/// Unknown tags are carried but never match anything, so they deny.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSet {
    tags: Vec<String>,
}

impl PermissionSet {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }

    /// Parse a comma-joined tag list (the form the tags travel in once a
    /// session is established).
    pub fn from_joined(joined: &str) -> Self {
        Self {
            tags: joined
                .split(',')
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Comma-joined form for transport and logging.
    pub fn joined(&self) -> String {
        self.tags.join(",")
    }

    /// Wildcard fast-path: exactly one tag and it is `*`.
    pub fn is_wildcard(&self) -> bool {
        self.tags.len() == 1 && self.tags[0] == "*"
    }

    /// Whether the set allows `capability`.
    pub fn can(&self, capability: Capability) -> bool {
        if self.is_wildcard() {
            return true;
        }

        self.tags.iter().any(|t| t == capability.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_allows_everything() {
        let set = PermissionSet::new(vec!["*".to_string()]);
        assert!(set.is_wildcard());
        for cap in [
            Capability::ListFiles,
            Capability::EditFiles,
            Capability::CreateFiles,
            Capability::SaveFiles,
            Capability::MoveFiles,
            Capability::DeleteFiles,
        ] {
            assert!(set.can(cap));
        }
    }

    #[test]
    fn test_wildcard_must_be_alone() {
        let set = PermissionSet::new(vec!["*".to_string(), "list-files".to_string()]);
        assert!(!set.is_wildcard());
        assert!(set.can(Capability::ListFiles));
        assert!(!set.can(Capability::DeleteFiles));
    }

    #[test]
    fn test_specific_tags() {
        let set = PermissionSet::new(vec!["list-files".to_string(), "edit-files".to_string()]);
        assert!(set.can(Capability::ListFiles));
        assert!(set.can(Capability::EditFiles));
        assert!(!set.can(Capability::SaveFiles));
        assert!(!set.can(Capability::MoveFiles));
    }

    #[test]
    fn test_empty_set_denies() {
        let set = PermissionSet::new(Vec::new());
        assert!(!set.can(Capability::ListFiles));
    }

    #[test]
    fn test_joined_round_trip() {
        let set = PermissionSet::from_joined("list-files,edit-files,create-files");
        assert_eq!(set.joined(), "list-files,edit-files,create-files");
        assert!(set.can(Capability::CreateFiles));

        let empty = PermissionSet::from_joined("");
        assert_eq!(empty.joined(), "");
        assert!(!empty.can(Capability::ListFiles));
    }
}
