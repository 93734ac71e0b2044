//! Hub publication of a saved checkpoint directory

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::path::Path;
use tracing::{info, warn};

const HUB_ENDPOINT: &str = "https://huggingface.co";

/// Files published from the checkpoint directory, when present.
const PUSHED_FILES: &[&str] = &[
    "README.md",
    "config.json",
    "tokenizer.json",
    "model.safetensors",
    "training_state.json",
];

/// Inline commits above this size tend to need LFS on the hub side.
const INLINE_LIMIT: u64 = 10 * 1024 * 1024;

/// Publish the checkpoint directory to the hub.
///
/// Creates the repo when needed (existing repos are fine), writes a model
/// card tagged with the dataset name, and uploads the directory files in a
/// single commit. Returns the repo URL.
pub fn push_to_hub(
    output_dir: &Path,
    repo_id: Option<&str>,
    dataset_name: &str,
    base_model: &str,
) -> Result<String> {
    let token = hub_token()?;

    let repo_id = match repo_id {
        Some(id) => id.to_string(),
        None => output_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .context("Cannot derive a hub repo id from the output directory")?,
    };

    let username = whoami(&token)?;
    let (full_id, organization) = qualify_repo_id(&repo_id, &username);
    info!("Pushing {:?} to {}/{}", output_dir, HUB_ENDPOINT, full_id);

    create_repo(&token, &full_id, organization.as_deref())?;

    let card_path = output_dir.join("README.md");
    if !card_path.exists() {
        std::fs::write(&card_path, model_card(&full_id, dataset_name, base_model))?;
    }

    commit_files(&token, &full_id, output_dir)?;

    Ok(format!("{}/{}", HUB_ENDPOINT, full_id))
}

fn hub_token() -> Result<String> {
    std::env::var("HF_TOKEN")
        .or_else(|_| std::env::var("HUGGING_FACE_HUB_TOKEN"))
        .context("--push-to-hub needs a token in HF_TOKEN or HUGGING_FACE_HUB_TOKEN")
}

fn whoami(token: &str) -> Result<String> {
    let response = ureq::get(&format!("{}/api/whoami-v2", HUB_ENDPOINT))
        .set("Authorization", &format!("Bearer {}", token))
        .call()
        .context("Failed to resolve the hub account for the token")?;
    let body: serde_json::Value = response.into_json()?;
    body.get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .context("Hub whoami response had no account name")
}

/// Expand a bare repo name to `namespace/name`. The organization is only
/// reported when it differs from the token's user.
fn qualify_repo_id(repo_id: &str, username: &str) -> (String, Option<String>) {
    match repo_id.split_once('/') {
        Some((namespace, _)) if namespace == username => (repo_id.to_string(), None),
        Some((namespace, _)) => (repo_id.to_string(), Some(namespace.to_string())),
        None => (format!("{}/{}", username, repo_id), None),
    }
}

fn create_repo(token: &str, full_id: &str, organization: Option<&str>) -> Result<()> {
    let name = full_id.split_once('/').map_or(full_id, |(_, name)| name);
    let mut payload = serde_json::json!({ "name": name, "type": "model" });
    if let Some(org) = organization {
        payload["organization"] = serde_json::Value::String(org.to_string());
    }

    let result = ureq::post(&format!("{}/api/repos/create", HUB_ENDPOINT))
        .set("Authorization", &format!("Bearer {}", token))
        .send_json(payload);

    match result {
        Ok(_) => {
            info!("Created hub repo {}", full_id);
            Ok(())
        }
        // Conflict: the repo already exists, which is fine for re-pushes.
        Err(ureq::Error::Status(409, _)) => Ok(()),
        Err(e) => {
            Err(anyhow::Error::from(e).context(format!("Failed to create hub repo {}", full_id)))
        }
    }
}

fn commit_files(token: &str, full_id: &str, output_dir: &Path) -> Result<()> {
    let mut lines = Vec::new();
    let mut file_count = 0usize;

    for name in PUSHED_FILES {
        let path = output_dir.join(name);
        if !path.exists() {
            continue;
        }
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read {:?} for upload", path))?;
        if bytes.len() as u64 > INLINE_LIMIT {
            warn!(
                "⚠️ {} is {:.1} MB; the hub may require LFS for files this large",
                name,
                bytes.len() as f64 / (1024.0 * 1024.0)
            );
        }
        lines.push(
            serde_json::json!({
                "key": "file",
                "value": {
                    "path": name,
                    "content": BASE64.encode(&bytes),
                    "encoding": "base64",
                }
            })
            .to_string(),
        );
        file_count += 1;
    }

    if file_count == 0 {
        anyhow::bail!("Nothing to push: {:?} has none of {:?}", output_dir, PUSHED_FILES);
    }

    let header = serde_json::json!({
        "key": "header",
        "value": { "summary": format!("Upload checkpoint ({} files)", file_count), "description": "" }
    })
    .to_string();

    let mut payload = header;
    for line in lines {
        payload.push('\n');
        payload.push_str(&line);
    }

    ureq::post(&format!("{}/api/models/{}/commit/main", HUB_ENDPOINT, full_id))
        .set("Authorization", &format!("Bearer {}", token))
        .set("Content-Type", "application/x-ndjson")
        .send_string(&payload)
        .with_context(|| format!("Failed to commit {} files to {}", file_count, full_id))?;

    info!("Committed {} files to {}", file_count, full_id);
    Ok(())
}

/// Model card with the dataset recorded as metadata.
fn model_card(full_id: &str, dataset_name: &str, base_model: &str) -> String {
    format!(
        "---\n\
         library_name: candle\n\
         base_model: {base}\n\
         datasets:\n\
         - {dataset}\n\
         tags:\n\
         - sft\n\
         - completion-only\n\
         ---\n\n\
         # {name}\n\n\
         Fine-tuned from `{base}` on `{dataset}` with completion-only loss.\n",
        base = base_model,
        dataset = dataset_name,
        name = full_id.split_once('/').map_or(full_id, |(_, n)| n),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_repo_id_gets_the_user_namespace() {
        let (full, org) = qualify_repo_id("my-tuned-model", "alice");
        assert_eq!(full, "alice/my-tuned-model");
        assert_eq!(org, None);
    }

    #[test]
    fn org_namespace_is_reported() {
        let (full, org) = qualify_repo_id("acme/my-tuned-model", "alice");
        assert_eq!(full, "acme/my-tuned-model");
        assert_eq!(org.as_deref(), Some("acme"));

        let (_, own) = qualify_repo_id("alice/my-tuned-model", "alice");
        assert_eq!(own, None);
    }

    #[test]
    fn model_card_records_the_dataset() {
        let card = model_card("alice/tuned", "data/chat.json", "base/model");
        assert!(card.contains("- data/chat.json"));
        assert!(card.contains("base_model: base/model"));
        assert!(card.starts_with("---\n"));
    }
}
