//! Checkpoint Management - Training state persistence

use anyhow::Result;
use candle_nn::VarMap;
use fs2::FileExt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Training state for serialization
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TrainingState {
    pub step: usize,
    pub loss: f32,
    pub date: String,
    pub checkpoint: String,
}

/// Save weights under an exclusive file lock so a concurrent reader never
/// sees a half-written checkpoint.
pub fn save_securely(varmap: &VarMap, path: &Path) -> Result<()> {
    let lock_path = PathBuf::from(format!("{}.lock", path.display()));
    let lock_file = File::create(&lock_path)?;
    lock_file.lock_exclusive()?;
    varmap.save(path)?;
    FileExt::unlock(&lock_file)?;
    Ok(())
}

/// Save training state alongside a checkpoint file
pub fn save_training_state(
    output_dir: &Path,
    checkpoint_name: &str,
    step: usize,
    loss: f32,
) -> Result<()> {
    let state = TrainingState {
        step,
        loss,
        date: chrono::Local::now().to_rfc3339(),
        checkpoint: format!("{}.safetensors", checkpoint_name),
    };

    let path = output_dir.join(format!("{}.json", checkpoint_name));
    let file = File::create(&path)?;
    serde_json::to_writer_pretty(file, &state)?;

    // Also save generic training_state.json for easy resume
    let generic_path = output_dir.join("training_state.json");
    if let Ok(file) = File::create(&generic_path) {
        let _ = serde_json::to_writer_pretty(file, &state);
    }

    Ok(())
}

/// Load training state from the output directory and return the start step
pub fn load_start_step(output_dir: &Path) -> usize {
    let state_path = output_dir.join("training_state.json");
    if state_path.exists() {
        if let Ok(file) = File::open(&state_path) {
            let reader = BufReader::new(file);
            if let Ok(json) = serde_json::from_reader::<_, serde_json::Value>(reader) {
                if let Some(s) = json.get("step").and_then(|v| v.as_u64()) {
                    return s as usize;
                }
            }
        }
    }
    0
}

/// Find checkpoint path for resuming
pub fn find_checkpoint_path(resume: Option<&PathBuf>, output_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = resume {
        tracing::info!("📂 Loading specific checkpoint: {:?}", path);
        return Some(path.clone());
    }

    let latest = output_dir.join("model-latest.safetensors");
    if latest.exists() {
        return Some(latest);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_state_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        save_training_state(dir.path(), "checkpoint_step_120", 120, 1.25)?;

        assert!(dir.path().join("checkpoint_step_120.json").exists());
        assert_eq!(load_start_step(dir.path()), 120);
        Ok(())
    }

    #[test]
    fn start_step_defaults_to_zero() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(load_start_step(dir.path()), 0);
        Ok(())
    }

    #[test]
    fn explicit_resume_wins_over_latest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("model-latest.safetensors"), b"x")?;

        let explicit = PathBuf::from("elsewhere/model.safetensors");
        assert_eq!(
            find_checkpoint_path(Some(&explicit), dir.path()),
            Some(explicit)
        );
        assert_eq!(
            find_checkpoint_path(None, dir.path()),
            Some(dir.path().join("model-latest.safetensors"))
        );
        Ok(())
    }
}
