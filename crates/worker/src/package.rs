//! Model directory preparation
//!
//! A model folder is either already unpacked (it contains every entry the
//! engine requires) or ships one of the configured archives, which is
//! extracted in place the first time the model is loaded.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use tensorbridge_common::{BridgeError, Result};
use tracing::info;

fn is_unpacked(model_dir: &Path, required: &[&str]) -> bool {
    required.iter().all(|entry| model_dir.join(entry).exists())
}

fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let out_path = dest.join(entry.mangled_name());
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&out_path)?;
            io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

/// Make sure `model_dir` holds an unpacked model
pub fn ensure_unpacked(model_dir: &Path, required: &[&str], archive_names: &[String]) -> Result<()> {
    if !model_dir.is_dir() {
        return Err(BridgeError::load_model(format!(
            "model folder {} does not exist",
            model_dir.display()
        )));
    }
    if is_unpacked(model_dir, required) {
        return Ok(());
    }

    let archive = archive_names
        .iter()
        .map(|name| model_dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            BridgeError::load_model(format!(
                "no model file was found in the model folder {}",
                model_dir.display()
            ))
        })?;

    info!(archive = %archive.display(), "Unpacking model archive");
    extract(&archive, model_dir)
        .map_err(|e| BridgeError::load_model(format!("Failed to unpack {}: {}", archive.display(), e)))?;

    if !is_unpacked(model_dir, required) {
        return Err(BridgeError::load_model(format!(
            "archive {} does not contain {}",
            archive.display(),
            required.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_archive(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn archives() -> Vec<String> {
        vec!["weights.zip".to_string()]
    }

    #[test]
    fn test_unpacked_folder_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.yaml"), "inputs: []").unwrap();
        ensure_unpacked(dir.path(), &["model.yaml"], &archives()).unwrap();
    }

    #[test]
    fn test_archive_is_extracted() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(&dir.path().join("weights.zip"), &[("model.yaml", "inputs: []\n")]);

        ensure_unpacked(dir.path(), &["model.yaml"], &archives()).unwrap();
        assert!(dir.path().join("model.yaml").is_file());
    }

    #[test]
    fn test_missing_model_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_unpacked(dir.path(), &["model.yaml"], &archives()).unwrap_err();
        assert!(matches!(err, BridgeError::LoadModel { .. }));

        write_archive(&dir.path().join("weights.zip"), &[("readme.txt", "nothing here")]);
        let err = ensure_unpacked(dir.path(), &["model.yaml"], &archives()).unwrap_err();
        assert!(err.to_string().contains("does not contain"));

        let missing = dir.path().join("absent");
        assert!(ensure_unpacked(&missing, &["model.yaml"], &archives()).is_err());
    }
}
