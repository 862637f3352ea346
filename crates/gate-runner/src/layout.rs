//! Artifact layouts: directory trees of linked or copied build outputs.

use crate::archive::{extract_archive, list_files};
use crate::fsutil::{copy_dir_filtered, ensure_dir, relsymlink, remove_existing_symlink};
use crate::GateError;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;
use tracing::debug;

pub const PROPERTIES_FILE: &str = "native-image.properties";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Relative symlink from the destination directory to the source.
    Symlink,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub source: PathBuf,
    pub placement: Placement,
}

/// Destinations keyed by subdirectory. Two entries may never share a
/// destination path.
#[derive(Debug, Clone, Default)]
pub struct ArtifactLayout {
    dirs: BTreeMap<PathBuf, Vec<(String, LayoutEntry)>>,
    destinations: BTreeMap<PathBuf, PathBuf>,
    extractions: Vec<(PathBuf, PathBuf)>,
    trees: Vec<(PathBuf, PathBuf)>,
}

fn file_name_of(source: &Path) -> Result<String> {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| GateError::config(format!("layout source has no file name: {}", source.display())))
}

impl ArtifactLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `source` as `subdir/<file name of source>`.
    pub fn add(&mut self, subdir: impl AsRef<Path>, source: impl Into<PathBuf>, placement: Placement) -> Result<()> {
        let source = source.into();
        let name = file_name_of(&source)?;
        self.add_as(subdir, name, source, placement)
    }

    pub fn add_as(
        &mut self,
        subdir: impl AsRef<Path>,
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        placement: Placement,
    ) -> Result<()> {
        let subdir = subdir.as_ref().to_path_buf();
        let name = name.into();
        let source = source.into();
        claim(&mut self.destinations, subdir.join(&name), &source)?;
        self.dirs
            .entry(subdir)
            .or_default()
            .push((name, LayoutEntry { source, placement }));
        Ok(())
    }

    /// Claims `subdir/<rel>` for every relative path, all or nothing.
    fn claim_all(&mut self, subdir: &Path, rels: &[PathBuf], source: &Path) -> Result<()> {
        let mut staged = self.destinations.clone();
        for rel in rels {
            claim(&mut staged, subdir.join(rel), source)?;
        }
        self.destinations = staged;
        Ok(())
    }

    pub fn add_all<I, P>(&mut self, subdir: impl AsRef<Path>, sources: I, placement: Placement) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for source in sources {
            self.add(subdir.as_ref(), source, placement)?;
        }
        Ok(())
    }

    /// Unpacks `archive` into `subdir` when the layout is built. Every file
    /// in the archive claims its destination now.
    pub fn add_extract(&mut self, subdir: impl AsRef<Path>, archive: impl Into<PathBuf>) -> Result<()> {
        let subdir = subdir.as_ref().to_path_buf();
        let archive = archive.into();
        let rels: Vec<PathBuf> = list_files(&archive)?
            .iter()
            .map(|name| normalized_rel(Path::new(name)))
            .collect();
        self.claim_all(&subdir, &rels, &archive)?;
        self.extractions.push((subdir, archive));
        Ok(())
    }

    /// Copies the contents of directory `source` into `subdir`.
    pub fn add_tree(&mut self, subdir: impl AsRef<Path>, source: impl Into<PathBuf>) -> Result<()> {
        let subdir = subdir.as_ref().to_path_buf();
        let source = source.into();
        let mut rels = Vec::new();
        for entry in WalkDir::new(&source) {
            let entry = entry?;
            if entry.file_type().is_dir() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&source) {
                rels.push(normalized_rel(rel));
            }
        }
        self.claim_all(&subdir, &rels, &source)?;
        self.trees.push((subdir, source));
        Ok(())
    }

    pub fn entries(&self, subdir: impl AsRef<Path>) -> Vec<(&str, &LayoutEntry)> {
        self.dirs
            .get(subdir.as_ref())
            .map(|list| list.iter().map(|(n, e)| (n.as_str(), e)).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.extractions.is_empty() && self.trees.is_empty()
    }

    fn subdirs(&self) -> Vec<&Path> {
        let mut out: Vec<&Path> = self.dirs.keys().map(PathBuf::as_path).collect();
        out.extend(self.extractions.iter().map(|(d, _)| d.as_path()));
        out.extend(self.trees.iter().map(|(d, _)| d.as_path()));
        out.sort();
        out.dedup();
        out
    }

    /// Materializes the layout under `root`. Every touched subdirectory is
    /// wiped first so leftovers from a previous build disappear. Returns the
    /// destination paths of the placed entries.
    pub fn build(self, root: &Path) -> Result<Vec<PathBuf>> {
        for subdir in self.subdirs() {
            if subdir.as_os_str().is_empty() {
                continue;
            }
            let dest = root.join(subdir);
            remove_existing_symlink(&dest)?;
            if dest.exists() {
                fs::remove_dir_all(&dest)
                    .with_context(|| format!("failed to clean {}", dest.display()))?;
            }
        }
        ensure_dir(root)?;

        let mut placed = Vec::new();
        for (subdir, entries) in &self.dirs {
            let dir = root.join(subdir);
            ensure_dir(&dir)?;
            for (name, entry) in entries {
                let dest = dir.join(name);
                remove_existing_symlink(&dest)?;
                debug!(source = %entry.source.display(), dest = %dest.display(), "layout entry");
                match entry.placement {
                    Placement::Symlink => relsymlink(&entry.source, &dest),
                    Placement::Copy => fs::copy(&entry.source, &dest).map(|_| ()).map_err(Into::into),
                }
                .with_context(|| {
                    format!("failed to place {} at {}", entry.source.display(), dest.display())
                })?;
                placed.push(dest);
            }
        }
        for (subdir, archive) in &self.extractions {
            debug!(archive = %archive.display(), subdir = %subdir.display(), "extracting");
            extract_archive(archive, &root.join(subdir))?;
        }
        for (subdir, source) in &self.trees {
            copy_dir_filtered(source, &root.join(subdir), &[])?;
        }
        Ok(placed)
    }
}

fn claim(destinations: &mut BTreeMap<PathBuf, PathBuf>, dest: PathBuf, source: &Path) -> Result<()> {
    if let Some(existing) = destinations.get(&dest) {
        return Err(GateError::config(format!(
            "layout destination {} is already taken by {} (cannot also place {})",
            dest.display(),
            existing.display(),
            source.display()
        )));
    }
    destinations.insert(dest, source.to_path_buf());
    Ok(())
}

fn normalized_rel(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// `<properties_dir>/<kind>-<flag>.properties`, if present.
pub fn option_properties_source(properties_dir: Option<&Path>, kind: &str, flag: &str) -> Option<PathBuf> {
    let candidate = properties_dir?.join(format!("{}-{}.properties", kind, flag));
    candidate.is_file().then_some(candidate)
}

/// Links `source` as `<dir>/native-image.properties`, replacing a previous
/// link. Does nothing without a source.
pub fn link_properties(dir: &Path, source: Option<&Path>) -> Result<()> {
    let target = dir.join(PROPERTIES_FILE);
    remove_existing_symlink(&target)?;
    if let Some(source) = source {
        ensure_dir(dir)?;
        relsymlink(source, &target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::test_dir;

    fn touch(path: &Path, body: &str) {
        ensure_dir(path.parent().expect("parent")).expect("dir");
        fs::write(path, body).expect("write");
    }

    #[test]
    fn colliding_destinations_are_rejected() {
        let mut layout = ArtifactLayout::new();
        layout
            .add("lib/boot", "/dists/a/graal-sdk.jar", Placement::Symlink)
            .expect("first");
        let err = layout
            .add("lib/boot", "/dists/b/graal-sdk.jar", Placement::Copy)
            .expect_err("collision");
        assert!(err.to_string().contains("lib/boot/graal-sdk.jar"));
        layout
            .add("lib/jvmci", "/dists/b/graal-sdk.jar", Placement::Copy)
            .expect("other subdir");
        assert_eq!(layout.entries("lib/boot").len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn build_links_copies_and_cleans_leftovers() {
        let root = test_dir("layout_build");
        let dists = root.join("dists");
        touch(&dists.join("graal.jar"), "graal");
        touch(&dists.join("truffle-api.jar"), "truffle");
        let image_root = root.join("native-image-root");
        touch(&image_root.join("lib/jvmci/stale.jar"), "old");

        let mut layout = ArtifactLayout::new();
        layout
            .add("lib/jvmci", dists.join("graal.jar"), Placement::Symlink)
            .expect("graal");
        layout
            .add("lib/truffle", dists.join("truffle-api.jar"), Placement::Copy)
            .expect("truffle");
        let placed = layout.build(&image_root).expect("build");
        assert_eq!(placed.len(), 2);

        let link = image_root.join("lib/jvmci/graal.jar");
        assert!(fs::symlink_metadata(&link).expect("meta").file_type().is_symlink());
        assert_eq!(fs::read_link(&link).expect("link"), PathBuf::from("../../../dists/graal.jar"));
        let copy = image_root.join("lib/truffle/truffle-api.jar");
        assert!(!fs::symlink_metadata(&copy).expect("meta").file_type().is_symlink());
        assert_eq!(fs::read_to_string(copy).expect("copy"), "truffle");
        assert!(!image_root.join("lib/jvmci/stale.jar").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn tree_over_linked_entry_is_rejected() {
        let root = test_dir("layout_tree_collision");
        touch(&root.join("dists/a.jar"), "original");
        touch(&root.join("tree/a.jar"), "from-tree");
        touch(&root.join("tree/b.jar"), "b");
        let mut layout = ArtifactLayout::new();
        layout
            .add("lib", root.join("dists/a.jar"), Placement::Symlink)
            .expect("jar");
        let err = layout.add_tree("lib", root.join("tree")).expect_err("collision");
        assert_eq!(crate::error::classify(&err).map(GateError::kind), Some("configuration_error"));
        assert!(err.to_string().contains("lib/a.jar"));

        layout.build(&root.join("out")).expect("build");
        assert!(!root.join("out/lib/b.jar").exists());
        assert_eq!(fs::read_to_string(root.join("dists/a.jar")).expect("read"), "original");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn extraction_claims_archive_files() {
        let root = test_dir("layout_extract_collision");
        touch(&root.join("payload/lib/libnfi.so"), "nfi");
        touch(&root.join("payload/include/nfi.h"), "h");
        let archive = root.join("nfi-native.tar");
        crate::archive::create_archive(&root.join("payload"), &archive, "").expect("tar");

        let mut layout = ArtifactLayout::new();
        layout.add_extract("tools/truffle", &archive).expect("extract");
        let err = layout
            .add_as("tools/truffle/lib", "libnfi.so", root.join("payload/lib/libnfi.so"), Placement::Copy)
            .expect_err("collision");
        assert!(err.to_string().contains("tools/truffle/lib/libnfi.so"));
        let err = layout.add_tree("tools/truffle", root.join("payload")).expect_err("tree");
        assert!(err.to_string().contains("already taken"));
        layout
            .add_as("tools/truffle", "README", root.join("payload/include/nfi.h"), Placement::Copy)
            .expect("free slot");

        let out = root.join("out");
        layout.build(&out).expect("build");
        assert_eq!(fs::read_to_string(out.join("tools/truffle/lib/libnfi.so")).expect("so"), "nfi");
        assert!(out.join("tools/truffle/README").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn nested_subdirs_survive_parent_cleanup() {
        let root = test_dir("layout_nested");
        touch(&root.join("dists/svm.jar"), "svm");
        touch(&root.join("dists/library-support.jar"), "support");
        let mut layout = ArtifactLayout::new();
        layout
            .add("lib/svm/builder", root.join("dists/svm.jar"), Placement::Symlink)
            .expect("builder");
        layout
            .add("lib/svm", root.join("dists/library-support.jar"), Placement::Symlink)
            .expect("svm");
        let image_root = root.join("out");
        layout.build(&image_root).expect("build");
        assert!(image_root.join("lib/svm/builder/svm.jar").exists());
        assert!(image_root.join("lib/svm/library-support.jar").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn properties_link_prefers_given_source() {
        let root = test_dir("layout_props");
        let props_dir = root.join("mx.substratevm");
        touch(&props_dir.join("tools-junit.properties"), "Args = -H:+x\n");
        assert!(option_properties_source(Some(&props_dir), "tools", "chromeinspector").is_none());
        let source = option_properties_source(Some(&props_dir), "tools", "junit").expect("source");
        let dir = root.join("tools/junit");
        link_properties(&dir, Some(&source)).expect("link");
        link_properties(&dir, Some(&source)).expect("relink");
        assert_eq!(
            fs::read_to_string(dir.join(PROPERTIES_FILE)).expect("read"),
            "Args = -H:+x\n"
        );
        let _ = fs::remove_dir_all(root);
    }
}
