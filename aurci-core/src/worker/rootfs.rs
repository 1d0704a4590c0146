//! The skeletal rootfs every build container receives before its first
//! phase: currently just the CI `.makepkg.conf`, baked into the binary.

use anyhow::{Context, Result};

const MAKEPKG_CONF: &str = include_str!("../../assets/makepkg.conf");
const MAKEPKG_CONF_PATH: &str = "home/ci/.makepkg.conf";

/// Tar archive to be unpacked over `/` of a fresh build container.
pub fn rootfs_tar() -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_size(MAKEPKG_CONF.len() as u64);
    builder
        .append_data(&mut header, MAKEPKG_CONF_PATH, MAKEPKG_CONF.as_bytes())
        .context("failed to build rootfs tar")?;
    builder.into_inner().context("failed to finish rootfs tar")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn rootfs_contains_the_makepkg_conf() {
        let bytes = rootfs_tar().unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut entries = archive.entries().unwrap();

        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(
            entry.path().unwrap().display().to_string(),
            "home/ci/.makepkg.conf"
        );
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert!(content.contains("MAKEFLAGS"));

        assert!(entries.next().is_none());
    }
}
