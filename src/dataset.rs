//! Chat dataset loading and ChatML rendering

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

/// Delimiters wrapping each turn of a rendered conversation.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    turn_start: String,
    role_sep: String,
    turn_end: String,
}

impl ChatTemplate {
    /// ChatML: `<|im_start|>{role}\n{content}<|im_end|>\n`
    pub fn chatml() -> Self {
        Self {
            turn_start: "<|im_start|>".to_string(),
            role_sep: "\n".to_string(),
            turn_end: "<|im_end|>\n".to_string(),
        }
    }

    /// Marker opening an assistant turn. The collator masks everything up to
    /// (and including) this span.
    pub fn assistant_start(&self) -> String {
        format!("{}assistant{}", self.turn_start, self.role_sep)
    }

    pub fn render(&self, conversation: &Conversation) -> String {
        let mut text = String::new();
        for message in &conversation.messages {
            text.push_str(&self.turn_start);
            text.push_str(&message.role);
            text.push_str(&self.role_sep);
            text.push_str(&message.content);
            text.push_str(&self.turn_end);
        }
        text
    }
}

/// Split-name to conversations mapping, loaded once and immutable for the
/// rest of the run.
#[derive(Debug, Clone)]
pub struct ChatDataset {
    splits: HashMap<String, Vec<Conversation>>,
}

impl ChatDataset {
    /// Load a single JSON file (top-level array or JSON-lines) and register
    /// it under `split_name`.
    ///
    /// Only deserialization is validated here; records without an assistant
    /// span surface at collation time.
    pub fn load_json(path: &Path, split_name: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset: {:?}", path))?;

        let conversations = if raw.trim_start().starts_with('[') {
            serde_json::from_str::<Vec<Conversation>>(&raw)
                .with_context(|| format!("Failed to parse dataset array: {:?}", path))?
        } else {
            let mut rows = Vec::new();
            for (line_num, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let conversation: Conversation =
                    serde_json::from_str(line).with_context(|| {
                        format!("Failed to parse record at line {} in {:?}", line_num + 1, path)
                    })?;
                rows.push(conversation);
            }
            rows
        };

        tracing::info!(
            "Dataset loaded: {:?} ({} conversations -> split '{}')",
            path,
            conversations.len(),
            split_name
        );

        let mut splits = HashMap::new();
        splits.insert(split_name.to_string(), conversations);
        Ok(Self { splits })
    }

    pub fn split(&self, name: &str) -> Result<&[Conversation]> {
        self.splits.get(name).map(Vec::as_slice).ok_or_else(|| {
            let mut available: Vec<&str> = self.splits.keys().map(String::as_str).collect();
            available.sort_unstable();
            anyhow::anyhow!("Unknown split '{}' (available: {:?})", name, available)
        })
    }

    pub fn len(&self, name: &str) -> usize {
        self.splits.get(name).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn conv(user: &str, assistant: &str) -> String {
        format!(
            r#"{{"messages":[{{"role":"user","content":"{}"}},{{"role":"assistant","content":"{}"}}]}}"#,
            user, assistant
        )
    }

    #[test]
    fn loads_json_array() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.json");
        std::fs::write(&path, format!("[{},{}]", conv("hi", "hello"), conv("a", "b")))?;

        let dataset = ChatDataset::load_json(&path, "train")?;
        let split = dataset.split("train")?;
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].messages[1].role, "assistant");
        Ok(())
    }

    #[test]
    fn loads_json_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.jsonl");
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "{}", conv("one", "1"))?;
        writeln!(file)?;
        writeln!(file, "{}", conv("two", "2"))?;

        let dataset = ChatDataset::load_json(&path, "train")?;
        assert_eq!(dataset.len("train"), 2);
        Ok(())
    }

    #[test]
    fn unknown_split_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.json");
        std::fs::write(&path, format!("[{}]", conv("hi", "hello")))?;

        let dataset = ChatDataset::load_json(&path, "train")?;
        assert!(dataset.split("validation").is_err());
        Ok(())
    }

    #[test]
    fn chatml_render() {
        let conversation = Conversation {
            messages: vec![
                Message {
                    role: "user".to_string(),
                    content: "Hi".to_string(),
                },
                Message {
                    role: "assistant".to_string(),
                    content: "Hello!".to_string(),
                },
            ],
        };
        let template = ChatTemplate::chatml();
        assert_eq!(
            template.render(&conversation),
            "<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\nHello!<|im_end|>\n"
        );
        assert_eq!(template.assistant_start(), "<|im_start|>assistant\n");
    }
}
