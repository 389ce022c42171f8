// src/uploads.rs
//
// Per-user upload storage under `<webroot>/uploads`. Blobs are stored as
// `<user>_<yyyymmddhhmmss>_<sanitized original>`; each user has an
// append-only metadata file `uploads/.meta/<user>.list` with one
// `stored|original|size|timestamp` record per line. Deletion rewrites the
// metadata through a `.tmp` file and an atomic rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::RavelResult;
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub stored_name: String,
    pub original_name: String,
    pub size: u64,
    pub timestamp: i64,
}

fn uploads_dir(webroot: &Path) -> PathBuf {
    webroot.join("uploads")
}

fn meta_path(webroot: &Path, user: &str) -> PathBuf {
    uploads_dir(webroot).join(".meta").join(format!("{}.list", user))
}

pub fn blob_path(webroot: &Path, stored_name: &str) -> PathBuf {
    uploads_dir(webroot).join(stored_name)
}

/// `<user>_<yyyymmddhhmmss>_<sanitized>` for a fresh upload.
pub fn stored_name(user: &str, original: &str) -> String {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    format!("{}_{}_{}", user, stamp, util::sanitize_filename(original))
}

/// Parse the user's metadata file; a missing file is an empty list.
pub fn load(webroot: &Path, user: &str) -> Vec<UploadRecord> {
    let file = match File::open(meta_path(webroot, user)) {
        Ok(file) => file,
        Err(_) => return Vec::new(),
    };
    let mut items = Vec::new();
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(4, '|');
        let (Some(stored), Some(original), Some(size), Some(ts)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };
        let (Ok(size), Ok(timestamp)) = (size.parse(), ts.parse()) else {
            continue;
        };
        items.push(UploadRecord {
            stored_name: stored.to_string(),
            original_name: original.to_string(),
            size,
            timestamp,
        });
    }
    items
}

pub fn owns(webroot: &Path, user: &str, stored: &str) -> bool {
    load(webroot, user).iter().any(|item| item.stored_name == stored)
}

/// Write the blob with create+truncate semantics; a partial write removes
/// the half-written file before the error propagates.
pub fn store_blob(webroot: &Path, stored: &str, data: &[u8]) -> RavelResult<()> {
    let dir = uploads_dir(webroot);
    fs::create_dir_all(dir.join(".meta"))?;
    let path = blob_path(webroot, stored);
    let result = File::create(&path).and_then(|mut file| file.write_all(data));
    if let Err(err) = result {
        let _ = fs::remove_file(&path);
        return Err(err.into());
    }
    // Serving checks world-readability; don't let the umask veto it.
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_mode(0o644);
    fs::set_permissions(&path, perms)?;
    Ok(())
}

/// Append one metadata record for `user`.
pub fn append_record(webroot: &Path, user: &str, record: &UploadRecord) -> RavelResult<()> {
    fs::create_dir_all(uploads_dir(webroot).join(".meta"))?;
    let mut meta = OpenOptions::new()
        .create(true)
        .append(true)
        .open(meta_path(webroot, user))?;
    writeln!(
        meta,
        "{}|{}|{}|{}",
        record.stored_name, record.original_name, record.size, record.timestamp
    )?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotListed,
}

/// Delete the blob and drop its metadata line via tmp + rename. The blob
/// being already gone is fine; a record that was never listed is not.
pub fn remove(webroot: &Path, user: &str, stored: &str) -> RavelResult<RemoveOutcome> {
    let meta = meta_path(webroot, user);
    let items = match File::open(&meta) {
        Ok(file) => BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>(),
        Err(_) => return Ok(RemoveOutcome::NotListed),
    };

    let mut removed = false;
    let kept: Vec<&String> = items
        .iter()
        .filter(|line| {
            let is_target = line.split('|').next() == Some(stored);
            if is_target {
                removed = true;
            }
            !is_target
        })
        .collect();
    if !removed {
        return Ok(RemoveOutcome::NotListed);
    }

    match fs::remove_file(blob_path(webroot, stored)) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let tmp = meta.with_extension("list.tmp");
    {
        let mut out = File::create(&tmp)?;
        for line in kept {
            writeln!(out, "{}", line)?;
        }
    }
    fs::rename(&tmp, &meta)?;
    Ok(RemoveOutcome::Removed)
}
