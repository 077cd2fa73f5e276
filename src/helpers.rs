//! Small shared helpers: instance path layout, the working-tree writer, and
//! the pagination index math used by both state store backends.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::pb;

/// Name of the top-level kustomization file inside every Instance directory.
pub const KUSTOMIZATION_FILE_NAME: &str = "kustomization.yaml";

/// Returns the Instance directory and kustomization file paths for a name.
pub fn instance_dir_file(instances_dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    let instance_dir = instances_dir.join(name);
    let instance_file = instance_dir.join(KUSTOMIZATION_FILE_NAME);
    (instance_dir, instance_file)
}

/// Indents subprocess output for readability in error messages.
pub fn indent(output: &str) -> String {
    output.replace('\n', "\n\t")
}

/// Ensures the parent directory exists, then writes the file.
pub async fn mkdir_file(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    debug!(file = %path.display(), "wrote file");
    Ok(())
}

/// Materializes an Instance into its scratch working tree:
/// `<instances_dir>/<name>/kustomization.yaml` plus every auxiliary file.
/// Idempotent under retry; never reads.
pub async fn write_instance_tree(
    instances_dir: &Path,
    instance: &pb::Instance,
) -> std::io::Result<()> {
    let (instance_dir, instance_file) = instance_dir_file(instances_dir, &instance.name);
    mkdir_file(&instance_file, &instance.kustomization_yaml).await?;
    for file in &instance.files {
        mkdir_file(&instance_dir.join(&file.relative_path), &file.contents).await?;
    }
    Ok(())
}

/// Converts 1-based inclusive `[start, stop]` bounds into slice indexes.
///
/// `start <= 0` means the beginning. A `stop` of 0 means "to the end"
/// (`None`); a positive `stop` is clamped to the collection length; a
/// negative `stop` is an empty window (`Some(0)`), not the unbounded
/// sentinel.
pub fn convert_start_stop_to_slice_indexes(
    start: i32,
    stop: i32,
    length: i32,
) -> (usize, Option<usize>) {
    let stop = if stop == 0 {
        None
    } else if stop < 0 {
        Some(0)
    } else {
        Some(stop.min(length) as usize)
    };
    let start = if start <= 0 { 0 } else { (start - 1) as usize };
    (start, stop)
}

/// Applies `[start, stop]` pagination to an already-sorted collection.
/// Out-of-range windows yield an empty list rather than panicking.
pub fn paginate<T>(mut items: Vec<T>, start: i32, stop: i32) -> Vec<T> {
    let (start, stop) = convert_start_stop_to_slice_indexes(start, stop, items.len() as i32);
    let start = start.min(items.len());
    if let Some(stop) = stop {
        items.truncate(stop.max(start));
    }
    items.split_off(start)
}

/// Returns the directory component of a relative path, empty for bare names.
pub fn dirname(relative_path: &str) -> String {
    match Path::new(relative_path).parent() {
        Some(parent) => parent.to_string_lossy().into_owned(),
        None => String::new(),
    }
}

/// Reads one overlay directory into `(kustomization_yaml, files)`, where
/// `files` is every file under the tree other than the top kustomization,
/// with paths relative to `dir`. Returns `None` when the directory has no
/// top-level kustomization file.
pub fn read_overlay_dir(dir: &Path) -> std::io::Result<Option<(String, Vec<pb::File>)>> {
    let top = dir.join(KUSTOMIZATION_FILE_NAME);
    if !top.is_file() {
        return Ok(None);
    }
    let kustomization_yaml = std::fs::read_to_string(&top)?;

    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.retain(|file| file.relative_path != KUSTOMIZATION_FILE_NAME);
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok(Some((kustomization_yaml, files)))
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<pb::File>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, files)?;
            continue;
        }
        let relative_path = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        files.push(pb::File {
            directory: dirname(&relative_path),
            contents: std::fs::read_to_string(&path)?,
            relative_path,
        });
    }
    Ok(())
}
