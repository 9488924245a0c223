//! Shared fixtures: a tools root populated with real tar.gz packages.

#![allow(dead_code)]

use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use tempfile::TempDir;
use toolstage_core::store::sha256_file;
use toolstage_core::{
    Arch, DependencyCache, Invoker, Os, PackageStore, PlatformKey, PlatformResolver, ToolManager,
};

pub const LINUX_ARM64: PlatformKey = PlatformKey::new(Os::Linux, Arch::Arm64);
pub const LINUX_X64: PlatformKey = PlatformKey::new(Os::Linux, Arch::X64);

/// A wget stand-in that reports its version.
pub const WGET_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "GNU Wget2 2.1.0 - multithreaded metalink/file/website downloader"
  exit 0
fi
echo "wget: missing URL" >&2
exit 1
"#;

pub const WGET_HEADER: &str = r#"#ifndef WGET_WGETVER_H
#define WGET_WGETVER_H

#define LIBWGET_VERSION "2.1.0"
#define LIBWGET_VERSION_MAJOR 2
#define LIBWGET_VERSION_MINOR 1
#define LIBWGET_VERSION_PATCH 0

#endif /* WGET_WGETVER_H */
"#;

/// One file inside a package archive.
pub struct Entry<'a> {
    pub path: &'a str,
    pub contents: &'a [u8],
    pub mode: u32,
}

pub struct Fixture {
    pub temp: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
        }
    }

    pub fn tools_root(&self) -> PathBuf {
        self.temp.path().join("tools")
    }

    pub fn scratch(&self) -> PathBuf {
        self.temp.path().join("scratch")
    }

    pub fn store(&self) -> PackageStore {
        PackageStore::new(self.tools_root(), self.scratch())
    }

    pub fn manager(&self, platform: PlatformKey) -> ToolManager {
        ToolManager::new(
            PlatformResolver::fixed(platform),
            self.store(),
            DependencyCache::default(),
            Invoker::default(),
        )
    }

    /// Write a tar.gz package and its manifest; returns the package directory.
    pub fn add_package(
        &self,
        name: &str,
        version: &str,
        platform: PlatformKey,
        entries: &[Entry<'_>],
        executable: &str,
        extra: serde_json::Value,
    ) -> PathBuf {
        let dir = self.tools_root().join(name).join(platform.to_string());
        std::fs::create_dir_all(&dir).unwrap();

        let archive_name = format!("{name}-{version}.tar.gz");
        let archive = dir.join(&archive_name);
        write_tarball(&archive, entries);

        let mut manifest = serde_json::json!({
            "name": name,
            "version": version,
            "archive": archive_name,
            "sha256": sha256_file(&archive).unwrap(),
            "executable": executable,
        });
        if let (Some(target), serde_json::Value::Object(extra)) = (manifest.as_object_mut(), extra) {
            target.extend(extra);
        }
        std::fs::write(
            dir.join("package.json"),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
        dir
    }

    /// The wget 2.1.0 package with its version header.
    pub fn add_wget(&self, platform: PlatformKey) -> PathBuf {
        let dir = self.add_package(
            "wget",
            "2.1.0",
            platform,
            &[
                Entry {
                    path: "bin/wget",
                    contents: WGET_SCRIPT.as_bytes(),
                    mode: 0o644,
                },
                Entry {
                    path: "share/doc/wget/README",
                    contents: b"GNU Wget2",
                    mode: 0o644,
                },
            ],
            "bin/wget",
            serde_json::json!({
                "versionHeader": "include/wgetver.h",
                "description": "GNU Wget2 command line downloader",
            }),
        );
        std::fs::create_dir_all(dir.join("include")).unwrap();
        std::fs::write(dir.join("include/wgetver.h"), WGET_HEADER).unwrap();
        dir
    }
}

pub fn write_tarball(path: &Path, entries: &[Entry<'_>]) {
    let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    let mut builder = Builder::new(encoder);
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(entry.path).unwrap();
        header.set_size(entry.contents.len() as u64);
        header.set_mode(entry.mode);
        header.set_cksum();
        builder.append(&header, entry.contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}
