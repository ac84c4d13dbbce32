//! Identity reconciliation against the directory service.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::credential::{MIN_CREDENTIAL_LENGTH, generate_credential, hash_credential};
use super::directory::DirectoryService;
use super::model::{AttributeChange, DirectoryEntry, Role, Subject};
use crate::config::AccountSettings;
use crate::error::{CourseHubError, Result};

const OBJECT_CLASSES: [&str; 2] = ["posixAccount", "inetOrgPerson"];
const LOOKUP_ATTRIBUTES: [&str; 4] = ["uidNumber", "gidNumber", "homeDirectory", "loginShell"];

/// Ensures a directory record exists for a subject and that its group
/// membership matches the role of the current request.
///
/// Existing records never get a new credential; only `gidNumber` and
/// `loginShell` are rewritten, and only when the role changed.
pub struct IdentityReconciler {
    directory: Arc<dyn DirectoryService>,
    accounts: AccountSettings,
}

impl IdentityReconciler {
    pub fn new(directory: Arc<dyn DirectoryService>, accounts: AccountSettings) -> Self {
        Self {
            directory,
            accounts,
        }
    }

    /// Distinguished name of the record for `username`.
    pub fn dn_for(&self, username: &str) -> String {
        format!("uid={},{}", username, self.accounts.base_dn)
    }

    pub fn group_for(&self, role: Role) -> u32 {
        match role {
            Role::Instructor => self.accounts.instructor_gid,
            Role::Learner => self.accounts.learner_gid,
        }
    }

    fn shell_for(&self, role: Role) -> &str {
        match role {
            Role::Instructor => &self.accounts.instructor_shell,
            Role::Learner => &self.accounts.learner_shell,
        }
    }

    /// Conventional home directory for `username`.
    pub fn home_for(&self, username: &str) -> PathBuf {
        self.accounts.home_root.join(username)
    }

    /// Resolves `username` to a [`Subject`], creating or updating the
    /// directory record as needed.
    ///
    /// # Arguments
    ///
    /// * `username` - LMS username, used verbatim as the record's `uid`
    /// * `role` - Role in the course being launched
    /// * `platform_subject_id` - Upstream numeric id; only needed when the
    ///   record does not exist yet
    ///
    /// # Errors
    ///
    /// - `Directory` for malformed usernames or directory protocol failures
    /// - `Config` when a record must be created but no numeric id is known
    /// - `Consistency` when the record disappears between search and update
    pub fn resolve(
        &self,
        username: &str,
        role: Role,
        platform_subject_id: Option<u32>,
    ) -> Result<Subject> {
        validate_username(username)?;

        match self.directory.search(username, &LOOKUP_ATTRIBUTES)? {
            None => self.create(username, role, platform_subject_id),
            Some(entry) => self.update(username, role, entry),
        }
    }

    /// Computes the subject [`resolve`](Self::resolve) would return, without
    /// writing to the directory.
    pub fn preview(
        &self,
        username: &str,
        role: Role,
        platform_subject_id: Option<u32>,
    ) -> Result<Subject> {
        validate_username(username)?;

        let (numeric_id, home_directory) =
            match self.directory.search(username, &LOOKUP_ATTRIBUTES)? {
                Some(entry) => (stored_uid(&entry), self.stored_home(&entry, username)),
                None => (
                    platform_subject_id.and_then(|id| id.checked_add(self.accounts.uid_offset)),
                    self.home_for(username),
                ),
            };

        Ok(Subject {
            username: username.to_string(),
            numeric_id,
            group_id: Some(self.group_for(role)),
            role,
            home_directory,
        })
    }

    fn stored_home(&self, entry: &DirectoryEntry, username: &str) -> PathBuf {
        entry
            .first("homeDirectory")
            .filter(|home| !home.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.home_for(username))
    }

    fn create(
        &self,
        username: &str,
        role: Role,
        platform_subject_id: Option<u32>,
    ) -> Result<Subject> {
        let numeric_id = platform_subject_id
            .and_then(|id| id.checked_add(self.accounts.uid_offset))
            .ok_or_else(|| {
                CourseHubError::config(format!(
                    "cannot create directory record for '{}': no numeric id available",
                    username
                ))
            })?;

        let group_id = self.group_for(role);
        let home = self.home_for(username);

        let mut rng = rand::thread_rng();
        let credential = generate_credential(&mut rng, MIN_CREDENTIAL_LENGTH);
        let password = hash_credential(&mut rng, &credential);

        let mut attributes = BTreeMap::new();
        let mut set = |name: &str, value: String| {
            attributes.insert(name.to_string(), vec![value]);
        };
        set("uid", username.to_string());
        set("cn", username.to_string());
        set("sn", username.to_string());
        set("uidNumber", numeric_id.to_string());
        set("gidNumber", group_id.to_string());
        set("homeDirectory", home.to_string_lossy().into_owned());
        set("loginShell", self.shell_for(role).to_string());
        set("userPassword", password);
        set(
            "mail",
            format!("{}@{}", username, self.accounts.email_domain),
        );

        let dn = self.dn_for(username);
        self.directory.add(&dn, &OBJECT_CLASSES, attributes)?;

        tracing::info!(
            username = %username,
            uid = numeric_id,
            gid = group_id,
            role = %role,
            "Registered new directory record"
        );

        Ok(Subject {
            username: username.to_string(),
            numeric_id: Some(numeric_id),
            group_id: Some(group_id),
            role,
            home_directory: home,
        })
    }

    fn update(&self, username: &str, role: Role, entry: DirectoryEntry) -> Result<Subject> {
        let numeric_id = stored_uid(&entry);
        if numeric_id.is_none() {
            tracing::warn!(
                username = %username,
                raw = ?entry.first("uidNumber"),
                "Directory record has no usable uidNumber"
            );
        }

        let desired_gid = self.group_for(role);
        let stored_gid = entry
            .first_int("gidNumber")
            .and_then(|id| u32::try_from(id).ok());

        if stored_gid != Some(desired_gid) {
            let changes = [
                AttributeChange::replace("gidNumber", desired_gid.to_string()),
                AttributeChange::replace("loginShell", self.shell_for(role)),
            ];
            match self.directory.modify(&entry.dn, &changes) {
                Ok(()) => {
                    tracing::info!(
                        username = %username,
                        from = ?stored_gid,
                        to = desired_gid,
                        "Updated group membership after role change"
                    );
                }
                Err(e) if e.is_not_found() => {
                    tracing::error!(
                        username = %username,
                        dn = %entry.dn,
                        "Directory record vanished while updating group membership"
                    );
                    return Err(CourseHubError::consistency(format!(
                        "directory record '{}' disappeared during update",
                        entry.dn
                    )));
                }
                Err(e) => return Err(e),
            }
        } else {
            tracing::debug!(username = %username, "Directory record already up to date");
        }

        let home_directory = self.stored_home(&entry, username);

        Ok(Subject {
            username: username.to_string(),
            numeric_id,
            group_id: Some(desired_gid),
            role,
            home_directory,
        })
    }
}

fn stored_uid(entry: &DirectoryEntry) -> Option<u32> {
    entry
        .first_int("uidNumber")
        .and_then(|id| u32::try_from(id).ok())
        .filter(|id| *id > 0)
}

fn validate_username(username: &str) -> Result<()> {
    let valid = !username.is_empty()
        && username != "."
        && username != ".."
        && !username.starts_with('-')
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'));
    if valid {
        Ok(())
    } else {
        Err(CourseHubError::directory(format!(
            "invalid username '{}'",
            username
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // In-memory directory service for testing
    #[derive(Default)]
    struct MockDirectory {
        entries: Mutex<HashMap<String, DirectoryEntry>>,
        adds: Mutex<usize>,
        modifies: Mutex<Vec<Vec<AttributeChange>>>,
        vanish_on_modify: bool,
    }

    impl MockDirectory {
        fn with_entry(username: &str, uid: &str, gid: &str) -> Self {
            let directory = Self::default();
            let mut attributes = BTreeMap::new();
            attributes.insert("uid".to_string(), vec![username.to_string()]);
            attributes.insert("uidNumber".to_string(), vec![uid.to_string()]);
            attributes.insert("gidNumber".to_string(), vec![gid.to_string()]);
            attributes.insert(
                "homeDirectory".to_string(),
                vec![format!("/jupyter/{}", username)],
            );
            attributes.insert("userPassword".to_string(), vec!["{SSHA256}old".to_string()]);
            directory.entries.lock().unwrap().insert(
                username.to_string(),
                DirectoryEntry {
                    dn: format!("uid={},ou=People,dc=example,dc=com", username),
                    object_classes: OBJECT_CLASSES.iter().map(|s| s.to_string()).collect(),
                    attributes,
                },
            );
            directory
        }

        fn password_of(&self, username: &str) -> Option<String> {
            self.entries
                .lock()
                .unwrap()
                .get(username)
                .and_then(|e| e.first("userPassword").map(str::to_string))
        }
    }

    impl DirectoryService for MockDirectory {
        fn search(&self, username: &str, _attributes: &[&str]) -> Result<Option<DirectoryEntry>> {
            Ok(self.entries.lock().unwrap().get(username).cloned())
        }

        fn add(
            &self,
            dn: &str,
            object_classes: &[&str],
            attributes: BTreeMap<String, Vec<String>>,
        ) -> Result<()> {
            let username = attributes["uid"][0].clone();
            *self.adds.lock().unwrap() += 1;
            self.entries.lock().unwrap().insert(
                username,
                DirectoryEntry {
                    dn: dn.to_string(),
                    object_classes: object_classes.iter().map(|s| s.to_string()).collect(),
                    attributes,
                },
            );
            Ok(())
        }

        fn modify(&self, dn: &str, changes: &[AttributeChange]) -> Result<()> {
            if self.vanish_on_modify {
                return Err(CourseHubError::not_found("directory record", dn));
            }
            self.modifies.lock().unwrap().push(changes.to_vec());
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .values_mut()
                .find(|e| e.dn == dn)
                .ok_or_else(|| CourseHubError::not_found("directory record", dn))?;
            for change in changes {
                if let AttributeChange::Replace { attribute, values } = change {
                    entry.attributes.insert(attribute.clone(), values.clone());
                }
            }
            Ok(())
        }
    }

    fn accounts() -> AccountSettings {
        AccountSettings {
            instructor_gid: 2000,
            learner_gid: 3000,
            ..AccountSettings::default()
        }
    }

    #[test]
    fn test_creates_missing_record_with_offset_id() {
        let directory = Arc::new(MockDirectory::default());
        let reconciler = IdentityReconciler::new(directory.clone(), accounts());

        let subject = reconciler.resolve("alice", Role::Learner, Some(5)).unwrap();

        assert_eq!(subject.numeric_id, Some(20005));
        assert_eq!(subject.group_id, Some(3000));
        assert_eq!(subject.home_directory, PathBuf::from("/jupyter/alice"));

        let entry = directory.search("alice", &[]).unwrap().unwrap();
        assert_eq!(entry.dn, "uid=alice,ou=People,dc=example,dc=com");
        assert_eq!(entry.first("loginShell"), Some("/sbin/nologin"));
        assert_eq!(entry.first("mail"), Some("alice@example.com"));
        let password = entry.first("userPassword").unwrap();
        assert!(password.starts_with("{SSHA256}"));
    }

    #[test]
    fn test_missing_record_without_numeric_id_is_config_error() {
        let reconciler = IdentityReconciler::new(Arc::new(MockDirectory::default()), accounts());
        let err = reconciler.resolve("bob", Role::Learner, None).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_existing_record_keeps_credential_and_group() {
        let directory = Arc::new(MockDirectory::with_entry("alice", "2001", "3000"));
        let reconciler = IdentityReconciler::new(directory.clone(), accounts());

        let subject = reconciler.resolve("alice", Role::Learner, Some(99)).unwrap();

        assert_eq!(subject.numeric_id, Some(2001));
        assert_eq!(*directory.adds.lock().unwrap(), 0);
        assert!(directory.modifies.lock().unwrap().is_empty());
        assert_eq!(directory.password_of("alice").as_deref(), Some("{SSHA256}old"));
    }

    #[test]
    fn test_role_change_updates_group_only() {
        let directory = Arc::new(MockDirectory::with_entry("carol", "2002", "3000"));
        let reconciler = IdentityReconciler::new(directory.clone(), accounts());

        let subject = reconciler.resolve("carol", Role::Instructor, None).unwrap();

        assert_eq!(subject.group_id, Some(2000));
        let modifies = directory.modifies.lock().unwrap();
        assert_eq!(modifies.len(), 1);
        assert_eq!(
            modifies[0][0],
            AttributeChange::replace("gidNumber", "2000")
        );
        assert_eq!(directory.password_of("carol").as_deref(), Some("{SSHA256}old"));
    }

    #[test]
    fn test_vanished_record_is_consistency_violation() {
        let mut directory = MockDirectory::with_entry("dave", "2003", "3000");
        directory.vanish_on_modify = true;
        let reconciler = IdentityReconciler::new(Arc::new(directory), accounts());

        let err = reconciler.resolve("dave", Role::Instructor, None).unwrap_err();
        assert!(err.is_consistency());
    }

    #[test]
    fn test_unusable_uid_resolves_to_none() {
        let directory = Arc::new(MockDirectory::with_entry("erin", "-1", "3000"));
        let reconciler = IdentityReconciler::new(directory, accounts());

        let subject = reconciler.resolve("erin", Role::Learner, None).unwrap();
        assert_eq!(subject.numeric_id, None);
    }

    #[test]
    fn test_rejects_path_like_usernames() {
        let reconciler = IdentityReconciler::new(Arc::new(MockDirectory::default()), accounts());
        for bad in ["", "..", "a/b", "uid=x,dc=y", "-rf"] {
            assert!(reconciler.resolve(bad, Role::Learner, Some(1)).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_preview_never_writes() {
        let directory = Arc::new(MockDirectory::with_entry("carol", "2002", "3000"));
        let reconciler = IdentityReconciler::new(directory.clone(), accounts());

        let existing = reconciler.preview("carol", Role::Instructor, None).unwrap();
        assert_eq!(existing.numeric_id, Some(2002));
        assert_eq!(existing.group_id, Some(2000));

        let fresh = reconciler.preview("frank", Role::Learner, Some(7)).unwrap();
        assert_eq!(fresh.numeric_id, Some(20007));
        assert_eq!(fresh.home_directory, PathBuf::from("/jupyter/frank"));

        assert_eq!(*directory.adds.lock().unwrap(), 0);
        assert!(directory.modifies.lock().unwrap().is_empty());
    }
}
