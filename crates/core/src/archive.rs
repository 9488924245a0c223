//! Archive unpacking for tool packages.
//!
//! All functions here are blocking; callers run them on the blocking pool.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io;
use std::path::Path;
use tar::Archive;
use tracing::{debug, trace};

use crate::descriptor::ArchiveKind;

/// Unpack `archive` into `dest`, which must already exist.
///
/// `raw_name` is the path a [`ArchiveKind::Raw`] package is copied to,
/// relative to `dest`. Entries that would land outside `dest` are refused.
pub fn unpack(kind: ArchiveKind, archive: &Path, dest: &Path, raw_name: &str) -> io::Result<()> {
    debug!(?kind, ?archive, ?dest, "Unpacking package archive");
    match kind {
        ArchiveKind::Tgz => {
            let decoder = GzDecoder::new(File::open(archive)?);
            unpack_tar(Archive::new(decoder), dest)
        }
        ArchiveKind::Tar => unpack_tar(Archive::new(File::open(archive)?), dest),
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(io::Error::other)?;
            zip.extract(dest).map_err(io::Error::other)
        }
        ArchiveKind::Raw => {
            let target = dest.join(raw_name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(archive, &target)?;
            Ok(())
        }
    }
}

fn unpack_tar<R: io::Read>(mut archive: Archive<R>, dest: &Path) -> io::Result<()> {
    archive.set_overwrite(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        trace!(path = ?entry.path()?, "Unpacking entry");
        // unpack_in refuses entries that escape `dest` and reports them as `false`
        if !entry.unpack_in(dest)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive entry {:?} escapes the destination", entry.path()?),
            ));
        }
    }
    Ok(())
}

/// Mark a file as executable (no-op outside unix).
pub fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use std::path::PathBuf;
    use tar::Builder;
    use tempfile::TempDir;

    fn create_test_tarball(dir: &Path, files: &[(&str, &[u8])]) -> PathBuf {
        let tarball_path = dir.join("test.tar.gz");
        let file = File::create(&tarball_path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);

        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, &content[..]).unwrap();
        }

        builder.into_inner().unwrap().finish().unwrap();
        tarball_path
    }

    fn create_test_zip(dir: &Path, files: &[(&str, &[u8])]) -> PathBuf {
        let zip_path = dir.join("test.zip");
        let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        for (path, content) in files {
            writer
                .start_file(*path, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        zip_path
    }

    #[test]
    fn test_unpack_tgz() {
        let temp = TempDir::new().unwrap();
        let tarball = create_test_tarball(
            temp.path(),
            &[("bin/wget", b"#!/bin/sh\n"), ("share/doc/README", b"docs")],
        );
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        unpack(ArchiveKind::Tgz, &tarball, &dest, "wget").unwrap();

        assert_eq!(std::fs::read(dest.join("bin/wget")).unwrap(), b"#!/bin/sh\n");
        assert_eq!(std::fs::read_to_string(dest.join("share/doc/README")).unwrap(), "docs");
    }

    #[test]
    fn test_unpack_zip() {
        let temp = TempDir::new().unwrap();
        let archive = create_test_zip(temp.path(), &[("tool/run.cmd", b"@echo off")]);
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        unpack(ArchiveKind::Zip, &archive, &dest, "unused").unwrap();

        assert_eq!(std::fs::read(dest.join("tool/run.cmd")).unwrap(), b"@echo off");
    }

    #[test]
    fn test_unpack_raw() {
        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("jq-linux");
        std::fs::write(&binary, b"ELF").unwrap();
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        unpack(ArchiveKind::Raw, &binary, &dest, "bin/jq").unwrap();

        assert_eq!(std::fs::read(dest.join("bin/jq")).unwrap(), b"ELF");
    }

    #[test]
    fn test_unpack_corrupt_gzip_fails() {
        let temp = TempDir::new().unwrap();
        let bogus = temp.path().join("bogus.tar.gz");
        std::fs::write(&bogus, b"definitely not gzip").unwrap();
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        assert!(unpack(ArchiveKind::Tgz, &bogus, &dest, "x").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_make_executable() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let file = temp.path().join("tool");
        std::fs::write(&file, b"x").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();

        make_executable(&file).unwrap();

        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
