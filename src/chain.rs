//! VHD chain bookkeeping inside one VDI directory.
//!
//! Basenames are fixed-width UTC timestamps, so the lexicographic order
//! of [`list_vhds`] is the chronological order of the chain.

use anyhow::Error;
use lazy_static::lazy_static;
use regex::Regex;

use crate::remote::{basename, is_missing, join, RemoteHandler};
use crate::vhd::VhdLibrary;

lazy_static! {
    static ref VHD_FILE_REGEX: Regex = Regex::new(r"^[0-9]{8}T[0-9]{6}Z\.vhd$").unwrap();
}

/// Suffix of quarantined VHDs left behind by a failed coalesce.
pub const TAINTED_SUFFIX: &str = ".tainted";

/// Sorted basenames of the VHDs in `dir`; a missing directory is an
/// empty chain (pre-run probes hit layouts that do not exist yet).
pub async fn list_vhds(remote: &dyn RemoteHandler, dir: &str) -> Result<Vec<String>, Error> {
    let mut names = match remote.list(dir).await {
        Ok(names) => names,
        Err(err) if is_missing(&err) => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    names.retain(|name| VHD_FILE_REGEX.is_match(name));
    names.sort_unstable();
    Ok(names)
}

/// Tainted markers in `dir`.
pub async fn list_tainted(remote: &dyn RemoteHandler, dir: &str) -> Result<Vec<String>, Error> {
    let names = match remote.list(dir).await {
        Ok(names) => names,
        Err(err) if is_missing(&err) => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    Ok(names
        .into_iter()
        .filter(|name| name.ends_with(TAINTED_SUFFIX))
        .collect())
}

/// The sibling of `child_path` its header designates as parent, if any.
pub async fn parent_of(
    vhd: &dyn VhdLibrary,
    remote: &dyn RemoteHandler,
    dir: &str,
    child_path: &str,
) -> Result<Option<String>, Error> {
    let header = vhd.read_header(remote, child_path).await?;
    let parent_name = match header.parent_unicode_name {
        Some(name) => name,
        None => return Ok(None),
    };
    Ok(list_vhds(remote, dir)
        .await?
        .into_iter()
        .find(|name| *name == parent_name)
        .map(|name| join(dir, &name)))
}

/// The sibling of `path` whose header designates it as parent, if any.
pub async fn child_of(
    vhd: &dyn VhdLibrary,
    remote: &dyn RemoteHandler,
    dir: &str,
    path: &str,
) -> Result<Option<String>, Error> {
    let own_name = basename(path);
    for name in list_vhds(remote, dir).await? {
        if name == own_name {
            continue;
        }
        let sibling = join(dir, &name);
        let header = match vhd.read_header(remote, &sibling).await {
            Ok(header) => header,
            Err(err) => {
                log::warn!("unable to read VHD header of {} - {:#}", sibling, err);
                continue;
            }
        };
        if header.parent_unicode_name.as_deref() == Some(own_name) {
            return Ok(Some(sibling));
        }
    }
    Ok(None)
}
