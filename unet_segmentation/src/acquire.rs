use std::process::{Command, Stdio};

use log::info;

use crate::{
    config::DatasetConfig,
    error::{Result, SegmentationError},
};

/// Clones the dataset repository into `config.root` unless that path
/// already exists. Returns whether a clone happened.
pub fn ensure_dataset(config: &DatasetConfig) -> Result<bool> {
    if config.root.exists() {
        info!("dataset already present at {}", config.root.display());
        return Ok(false);
    }

    info!("cloning {} into {}", config.url, config.root.display());
    let output = Command::new("git")
        .arg("clone")
        .arg(&config.url)
        .arg(&config.root)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| SegmentationError::Acquire(format!("cannot run git: {err}")))?;

    if !output.status.success() {
        return Err(SegmentationError::Acquire(format!(
            "git clone {} exited with {}: {}",
            config.url,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn existing_root_is_not_cloned_again() {
        let tmp = tempdir().unwrap();
        let mut config = DatasetConfig::rooted_at(tmp.path());
        config.url = String::from("file:///nonexistent/repository");
        assert!(!ensure_dataset(&config).unwrap());
    }

    #[test]
    fn failed_clone_is_an_acquire_error() {
        let tmp = tempdir().unwrap();
        let mut config = DatasetConfig::rooted_at(tmp.path().join("dataset"));
        config.url = tmp.path().join("no-such-repo").to_string_lossy().into_owned();

        assert!(matches!(ensure_dataset(&config), Err(SegmentationError::Acquire(_))));
        assert!(!config.root.exists());
    }
}
