//! Passwd/group resolution for the `user` field of exec requests.
//!
//! A user spec comes in three forms:
//! - `uid:gid`: each half is numeric-or-name
//! - bare numeric: uid; gid and home come from the matching passwd line
//! - name: looked up in `/etc/passwd`
//!
//! `/etc/passwd` and `/etc/group` are parsed as colon-delimited records,
//! skipping blank and `#`-prefixed lines.

use std::path::Path;

pub const PASSWD_PATH: &str = "/etc/passwd";
pub const GROUP_PATH: &str = "/etc/group";

/// A resolved uid/gid pair plus the home directory when the passwd entry
/// supplied one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub home: Option<String>,
}

/// One record from `/etc/passwd`:
/// `name:passwd:uid:gid:gecos:home:shell`.
#[derive(Debug, Clone)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
}

/// One record from `/etc/group`: `name:passwd:gid:members`.
#[derive(Debug, Clone)]
struct GroupEntry {
    name: String,
    gid: u32,
}

/// Resolve a user spec against the system databases.
pub fn resolve_spec(spec: &str) -> Result<ResolvedUser, String> {
    resolve_spec_at(spec, Path::new(PASSWD_PATH), Path::new(GROUP_PATH))
}

/// Resolve a user spec against explicit database paths.
pub fn resolve_spec_at(spec: &str, passwd: &Path, group: &Path) -> Result<ResolvedUser, String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err("empty user spec".to_string());
    }

    let passwd_entries = parse_passwd(passwd)?;

    if let Some((user_part, group_part)) = spec.split_once(':') {
        // uid:gid form; each half may be numeric or a name.
        let (uid, home) = resolve_user_half(user_part, &passwd_entries)?;
        let gid = resolve_group_half(group_part, &passwd_entries, group)?;
        return Ok(ResolvedUser { uid, gid, home });
    }

    if let Ok(uid) = spec.parse::<u32>() {
        // Bare numeric uid; pull gid and home from the passwd line when
        // one exists, otherwise fall back to gid == uid.
        return match passwd_entries.iter().find(|e| e.uid == uid) {
            Some(entry) => Ok(ResolvedUser {
                uid,
                gid: entry.gid,
                home: Some(entry.home.clone()),
            }),
            None => Ok(ResolvedUser {
                uid,
                gid: uid,
                home: None,
            }),
        };
    }

    // Plain name.
    let entry = passwd_entries
        .iter()
        .find(|e| e.name == spec)
        .ok_or_else(|| format!("user_not_found: {}", spec))?;
    Ok(ResolvedUser {
        uid: entry.uid,
        gid: entry.gid,
        home: Some(entry.home.clone()),
    })
}

fn resolve_user_half(
    part: &str,
    passwd_entries: &[PasswdEntry],
) -> Result<(u32, Option<String>), String> {
    if let Ok(uid) = part.parse::<u32>() {
        let home = passwd_entries
            .iter()
            .find(|e| e.uid == uid)
            .map(|e| e.home.clone());
        return Ok((uid, home));
    }
    let entry = passwd_entries
        .iter()
        .find(|e| e.name == part)
        .ok_or_else(|| format!("user_not_found: {}", part))?;
    Ok((entry.uid, Some(entry.home.clone())))
}

fn resolve_group_half(
    part: &str,
    passwd_entries: &[PasswdEntry],
    group_path: &Path,
) -> Result<u32, String> {
    if let Ok(gid) = part.parse::<u32>() {
        return Ok(gid);
    }
    let groups = parse_group(group_path)?;
    if let Some(g) = groups.iter().find(|g| g.name == part) {
        return Ok(g.gid);
    }
    // A group name may also be a user's primary group.
    if let Some(e) = passwd_entries.iter().find(|e| e.name == part) {
        return Ok(e.gid);
    }
    Err(format!("group_not_found: {}", part))
}

fn parse_passwd(path: &Path) -> Result<Vec<PasswdEntry>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("read {}: {}", path.display(), e))?;

    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 6 {
            continue;
        }
        let (Ok(uid), Ok(gid)) = (fields[2].parse::<u32>(), fields[3].parse::<u32>()) else {
            continue;
        };
        entries.push(PasswdEntry {
            name: fields[0].to_string(),
            uid,
            gid,
            home: fields[5].to_string(),
        });
    }
    Ok(entries)
}

fn parse_group(path: &Path) -> Result<Vec<GroupEntry>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("read {}: {}", path.display(), e))?;

    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 {
            continue;
        }
        let Ok(gid) = fields[2].parse::<u32>() else {
            continue;
        };
        entries.push(GroupEntry {
            name: fields[0].to_string(),
            gid,
        });
    }
    Ok(entries)
}
