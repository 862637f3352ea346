use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path of `target` expressed relative to the directory `base`.
///
/// Both paths are normalized lexically; symlinks are not resolved.
pub fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target = normalize_path(target);
    let base = normalize_path(base);
    let t: Vec<Component> = target.components().collect();
    let b: Vec<Component> = base.components().collect();
    let common = t.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    let mut out = PathBuf::new();
    for _ in common..b.len() {
        out.push("..");
    }
    for c in &t[common..] {
        out.push(c.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Removes `path` if it is a symlink (dangling or not) and returns it.
pub fn remove_existing_symlink(path: &Path) -> Result<&Path> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            fs::remove_file(path)?;
        }
    }
    Ok(path)
}

/// Creates `dest` as a symlink to `target`, relative to `dest`'s directory.
pub fn relsymlink(target: &Path, dest: &Path) -> Result<()> {
    let base = dest.parent().unwrap_or_else(|| Path::new("."));
    let absolute_target = absolutize(target)?;
    let absolute_base = absolutize(base)?;
    let rel = relative_path(&absolute_target, &absolute_base);
    #[cfg(unix)]
    {
        symlink(&rel, dest)?;
    }
    #[cfg(not(unix))]
    {
        let _ = rel;
        fs::copy(target, dest)?;
    }
    Ok(())
}

pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize_path(path))
    } else {
        Ok(normalize_path(&std::env::current_dir()?.join(path)))
    }
}

pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        if rel.as_os_str().is_empty() {
            return true;
        }
        !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    ensure_dir(dst)?;
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            let link_target = fs::read_link(path)?;
            remove_existing_symlink(&target)?;
            #[cfg(unix)]
            {
                symlink(&link_target, &target)?;
            }
            #[cfg(not(unix))]
            {
                let _ = link_target;
                if let Ok(real) = fs::canonicalize(path) {
                    if real.is_file() {
                        fs::copy(real, &target)?;
                    }
                }
            }
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, target)?;
        }
    }
    Ok(())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Splits a shell-escaped string into words (POSIX quoting rules for `'`,
/// `"` and `\`). An unterminated quote is a configuration error.
pub fn shell_split(s: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => cur.push(ch),
                        None => {
                            return Err(crate::GateError::config(format!(
                                "unterminated single quote in: {}",
                                s
                            )))
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => cur.push(ch),
                            Some(ch) => {
                                cur.push('\\');
                                cur.push(ch);
                            }
                            None => break,
                        },
                        Some(ch) => cur.push(ch),
                        None => {
                            return Err(crate::GateError::config(format!(
                                "unterminated double quote in: {}",
                                s
                            )))
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    cur.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                cur.push(c);
            }
        }
    }
    if in_word {
        words.push(cur);
    }
    Ok(words)
}

#[cfg(test)]
pub(crate) fn test_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "gate_{}_test_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("temp dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_walks_up_to_common_ancestor() {
        let rel = relative_path(
            Path::new("/build/mxbuild/dists/graal.jar"),
            Path::new("/build/svmbuild/root/lib/jvmci"),
        );
        assert_eq!(rel, PathBuf::from("../../../../mxbuild/dists/graal.jar"));
        let same = relative_path(Path::new("/a/b"), Path::new("/a/b"));
        assert_eq!(same, PathBuf::from("."));
    }

    #[test]
    fn shell_split_honors_quotes() {
        let words = shell_split(r#"-Dgraal.Dump= -XX:+UseJVMCICompiler "-Dx=a b" 'c d'\ e"#)
            .expect("split");
        assert_eq!(
            words,
            vec!["-Dgraal.Dump=", "-XX:+UseJVMCICompiler", "-Dx=a b", "c d e"]
        );
        assert!(shell_split("'open").is_err());
        assert!(shell_split("   ").expect("blank").is_empty());
    }

    #[test]
    fn shell_quote_round_trips_through_split() {
        let parts = vec!["java".to_string(), "-Dmsg=it's here".to_string(), String::new()];
        let joined = shell_join(&parts);
        assert_eq!(shell_split(&joined).expect("split"), parts);
    }

    #[cfg(unix)]
    #[test]
    fn relsymlink_points_relative_to_dest_dir() {
        let root = test_dir("relsymlink");
        let src = root.join("dists").join("a.jar");
        ensure_dir(src.parent().expect("parent")).expect("dists");
        fs::write(&src, b"jar").expect("write");
        let dest_dir = root.join("lib").join("boot");
        ensure_dir(&dest_dir).expect("dest");
        let dest = dest_dir.join("a.jar");
        relsymlink(&src, &dest).expect("link");
        assert_eq!(
            fs::read_link(&dest).expect("read link"),
            PathBuf::from("../../dists/a.jar")
        );
        assert_eq!(fs::read(&dest).expect("follow"), b"jar");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sha256_file_matches_bytes_digest() {
        let root = test_dir("sha");
        let f = root.join("x.bin");
        fs::write(&f, b"payload").expect("write");
        assert_eq!(sha256_file(&f).expect("digest"), sha256_bytes(b"payload"));
        let _ = fs::remove_dir_all(root);
    }
}
