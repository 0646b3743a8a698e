//! On-disk execution package store.
//!
//! Layout: `<root>/<package-id>/` holds the extracted package —
//! `package.json`, `data/scene.json`, `data/project.json`,
//! `data/models/*.json`, `object_types/*.src`, `action_points.src` and
//! the `script` executable. Uploads land in a staging directory first
//! and are swapped in with a rename so a crash never leaves a
//! half-written package under its final name.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::Utc;

use arcor_domain::package::{PackageMeta, PackageSummary};
use arcor_domain::project::Project;
use arcor_domain::{Error, Result};

const PACKAGE_META: &str = "package.json";
const PROJECT_FILE: &str = "data/project.json";
const SCRIPT_FILE: &str = "script";
const STAGING_PREFIX: &str = ".staging-";

pub struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let store = Self { root };
        store.sweep_staging();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.dir(id).join(PACKAGE_META).is_file()
    }

    /// Remove staging leftovers of a previous crash.
    fn sweep_staging(&self) {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(STAGING_PREFIX) {
                tracing::warn!(path = %entry.path().display(), "removing stale staging directory");
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
    }

    /// Store a package from zip bytes, replacing any previous content.
    pub fn upload(&self, id: &str, zip_bytes: &[u8]) -> Result<PackageSummary> {
        validate_package_id(id)?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.root)?;

        extract_zip(zip_bytes, staging.path())?;
        make_script_executable(staging.path())?;
        // Parse the metadata before committing so a broken archive never
        // replaces a good package.
        let summary = read_summary(id, staging.path())?;

        let target = self.dir(id);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(staging.keep(), &target)?;
        Ok(summary)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        validate_package_id(id)?;
        let dir = self.dir(id);
        if !dir.exists() {
            return Err(Error::NotFound(format!("Package {id}")));
        }
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    pub fn info(&self, id: &str) -> Result<PackageSummary> {
        validate_package_id(id)?;
        let dir = self.dir(id);
        if !dir.join(PACKAGE_META).is_file() {
            return Err(Error::NotFound(format!("Package {id}")));
        }
        read_summary(id, &dir)
    }

    pub fn list(&self) -> Result<Vec<PackageSummary>> {
        let mut packages = Vec::new();
        for entry in std::fs::read_dir(&self.root)?.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if id.starts_with(STAGING_PREFIX) {
                continue;
            }
            match read_summary(&id, &entry.path()) {
                Ok(summary) => packages.push(summary),
                Err(e) => {
                    tracing::warn!(package = %id, error = %e, "skipping unreadable package");
                }
            }
        }
        packages.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(packages)
    }

    /// Stamp the `executed` timestamp; called on every successful start.
    pub fn mark_executed(&self, id: &str) -> Result<()> {
        let path = self.dir(id).join(PACKAGE_META);
        let raw = std::fs::read_to_string(&path)?;
        let mut meta: PackageMeta = serde_json::from_str(&raw)?;
        meta.executed = Some(Utc::now());
        std::fs::write(&path, serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }
}

/// Ids become directory names; refuse anything that could escape root.
fn validate_package_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid package id '{id}'.")))
    }
}

fn extract_zip(bytes: &[u8], target: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::Validation(format!("Invalid zip file: {e}")))?;
    archive
        .extract(target)
        .map_err(|e| Error::Validation(format!("Invalid zip file: {e}")))?;
    Ok(())
}

fn make_script_executable(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let script = dir.join(SCRIPT_FILE);
    if script.is_file() {
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn read_summary(id: &str, dir: &Path) -> Result<PackageSummary> {
    let meta_raw = std::fs::read_to_string(dir.join(PACKAGE_META))?;
    let package_meta: PackageMeta = serde_json::from_str(&meta_raw)?;

    let (project_id, modified) = match std::fs::read_to_string(dir.join(PROJECT_FILE)) {
        Ok(raw) => {
            let project: Project = serde_json::from_str(&raw)?;
            (project.id, project.modified)
        }
        Err(_) => (String::new(), None),
    };

    Ok(PackageSummary {
        id: id.to_owned(),
        project_id,
        modified,
        package_meta,
    })
}

/// Recursive copy used when a run starts from a stored package.
pub fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)?.flatten() {
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if src.is_dir() {
            copy_tree(&src, &dst)?;
        } else {
            std::fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_zip(project_id: &str) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("package.json", options).unwrap();
            writer
                .write_all(
                    serde_json::to_string(&PackageMeta {
                        name: "demo".into(),
                        built: Utc::now(),
                        executed: None,
                    })
                    .unwrap()
                    .as_bytes(),
                )
                .unwrap();
            writer.add_directory("data", options).unwrap();
            writer.start_file("data/project.json", options).unwrap();
            let project = arcor_domain::project::Project::new("scene-1", "proj", "", true);
            let mut project = project;
            project.id = project_id.to_owned();
            writer
                .write_all(serde_json::to_string(&project).unwrap().as_bytes())
                .unwrap();
            writer.start_file("script", options).unwrap();
            writer.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn upload_list_info_delete_cycle() {
        let root = tempfile::tempdir().unwrap();
        let store = PackageStore::new(root.path().to_path_buf()).unwrap();

        let summary = store.upload("pkg1", &make_zip("proj-42")).unwrap();
        assert_eq!(summary.id, "pkg1");
        assert_eq!(summary.project_id, "proj-42");
        assert_eq!(summary.package_meta.name, "demo");

        assert_eq!(store.list().unwrap().len(), 1);
        assert!(store.exists("pkg1"));
        store.info("pkg1").unwrap();

        store.delete("pkg1").unwrap();
        assert!(!store.exists("pkg1"));
        assert!(store.list().unwrap().is_empty());
        assert!(matches!(store.info("pkg1"), Err(Error::NotFound(_))));
    }

    #[test]
    fn script_becomes_executable() {
        use std::os::unix::fs::PermissionsExt;
        let root = tempfile::tempdir().unwrap();
        let store = PackageStore::new(root.path().to_path_buf()).unwrap();
        store.upload("pkg1", &make_zip("p")).unwrap();
        let mode = std::fs::metadata(store.dir("pkg1").join("script"))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[test]
    fn executed_stamp_survives_reread() {
        let root = tempfile::tempdir().unwrap();
        let store = PackageStore::new(root.path().to_path_buf()).unwrap();
        store.upload("pkg1", &make_zip("p")).unwrap();
        assert!(store.info("pkg1").unwrap().package_meta.executed.is_none());
        store.mark_executed("pkg1").unwrap();
        assert!(store.info("pkg1").unwrap().package_meta.executed.is_some());
    }

    #[test]
    fn bad_ids_and_bad_archives_rejected() {
        let root = tempfile::tempdir().unwrap();
        let store = PackageStore::new(root.path().to_path_buf()).unwrap();
        assert!(store.upload("../escape", &make_zip("p")).is_err());
        assert!(store.upload("pkg1", b"not a zip").is_err());
        // A failed upload never creates the package.
        assert!(!store.exists("pkg1"));
    }

    #[test]
    fn stale_staging_swept_on_startup() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join(format!("{STAGING_PREFIX}left-over"));
        std::fs::create_dir_all(&stale).unwrap();
        let _store = PackageStore::new(root.path().to_path_buf()).unwrap();
        assert!(!stale.exists());
    }
}
