//! File persistence helpers
//!
//! - `CredentialStore` - Provider secrets feeding the redaction hook
//! - `atomic_write` - Write-to-temp then rename, used for whole-document saves

pub mod credentials;

pub use credentials::CredentialStore;

use std::fs;
use std::io;
use std::path::Path;

/// Replace `dest` with `bytes` so readers never observe a partial file
pub fn atomic_write(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp = dest.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes)?;

    if let Err(err) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}
