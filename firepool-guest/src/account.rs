//! Local account lookup for dropping privileges before starting the runner.
//!
//! The guest image ships a plain `/etc/passwd` and `/etc/group`; no NSS
//! modules are involved, so the files are read directly.

use std::path::{Path, PathBuf};

use crate::GuestError;

pub const PASSWD_FILE: &str = "/etc/passwd";
pub const GROUP_FILE: &str = "/etc/group";

/// Credentials the runner process is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Account {
    pub(crate) name: String,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) home: Option<PathBuf>,
}

/// Resolve `owner`, and `group` if given, against the account databases.
///
/// Without `group` the owner's primary group is used.
pub(crate) async fn resolve(
    passwd_file: &Path,
    group_file: &Path,
    owner: &str,
    group: Option<&str>,
) -> Result<Account, GuestError> {
    let passwd = tokio::fs::read_to_string(passwd_file).await?;
    let mut account = find_user(&passwd, owner).ok_or_else(|| GuestError::UnknownUser(owner.to_owned()))?;

    if let Some(group) = group {
        let groups = tokio::fs::read_to_string(group_file).await?;
        account.gid = find_group(&groups, group).ok_or_else(|| GuestError::UnknownGroup(group.to_owned()))?;
    }
    Ok(account)
}

/// `name:password:uid:gid:gecos:home:shell`
fn find_user(passwd: &str, name: &str) -> Option<Account> {
    passwd.lines().filter(|l| !l.starts_with('#')).find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 || fields[0] != name {
            return None;
        }
        Some(Account {
            name: name.to_owned(),
            uid: fields[2].parse().ok()?,
            gid: fields[3].parse().ok()?,
            home: Some(fields[5]).filter(|h| !h.is_empty()).map(PathBuf::from),
        })
    })
}

/// `name:password:gid:members`
fn find_group(groups: &str, name: &str) -> Option<u32> {
    groups.lines().filter(|l| !l.starts_with('#')).find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 || fields[0] != name {
            return None;
        }
        fields[2].parse().ok()
    })
}
