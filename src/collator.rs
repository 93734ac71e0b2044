//! Completion-only collation: loss restricted to assistant responses

use anyhow::Result;
use candle_core::{Device, Tensor};
use rayon::prelude::*;
use tokenizers::Tokenizer;
use tracing::warn;

use crate::dataset::{ChatTemplate, Conversation};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// One collated micro-batch, shifted for next-token prediction.
///
/// `inputs`/`targets`: [batch, seq] token ids, `mask`: [batch, seq] with 1.0
/// exactly where the shifted label is trainable.
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
    pub mask: Tensor,
}

/// Turns raw conversations into `(inputs, targets, mask)` tensors, masking
/// every label before the end of the assistant marker.
pub struct CompletionOnlyCollator {
    tokenizer: Tokenizer,
    template: ChatTemplate,
    response_token_ids: Vec<u32>,
    max_seq_len: usize,
}

impl CompletionOnlyCollator {
    pub fn new(
        response_template: &str,
        tokenizer: Tokenizer,
        template: ChatTemplate,
        max_seq_len: usize,
    ) -> Result<Self> {
        let encoding = tokenizer
            .encode(response_template, false)
            .map_err(|e| anyhow::anyhow!("Failed to tokenize response template: {}", e))?;
        let response_token_ids = encoding.get_ids().to_vec();
        if response_token_ids.is_empty() {
            anyhow::bail!(
                "Response template {:?} tokenizes to nothing",
                response_template
            );
        }

        Ok(Self {
            tokenizer,
            template,
            response_token_ids,
            max_seq_len,
        })
    }

    /// Render and tokenize one conversation, truncated to the sequence cap.
    pub fn encode(&self, conversation: &Conversation) -> Result<Vec<u32>> {
        let text = self.template.render(conversation);
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Failed to tokenize conversation: {}", e))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(self.max_seq_len);
        Ok(ids)
    }

    /// Labels for one tokenized example.
    ///
    /// Everything up to and including the end of the *last* occurrence of
    /// the response marker is set to [`IGNORE_INDEX`]; later positions keep
    /// their token id. An example without the marker (never present, or
    /// truncated away) is ignored entirely.
    pub fn mask_labels(&self, ids: &[u32]) -> Vec<i64> {
        let mut labels: Vec<i64> = ids.iter().map(|&id| i64::from(id)).collect();

        match find_last_subsequence(ids, &self.response_token_ids) {
            Some(start) => {
                let end = start + self.response_token_ids.len();
                for label in labels.iter_mut().take(end) {
                    *label = IGNORE_INDEX;
                }
            }
            None => {
                warn!(
                    "Response template not found in example; masking the whole sequence. \
                     Loss will ignore this example."
                );
                labels.iter_mut().for_each(|l| *l = IGNORE_INDEX);
            }
        }

        labels
    }

    /// Collate a slice of conversations into one shifted, padded batch.
    ///
    /// Padding uses token id 0 with a zero mask, so it never reaches the
    /// loss. Examples shorter than two tokens contribute an all-pad row.
    pub fn collate(&self, conversations: &[Conversation], device: &Device) -> Result<Batch> {
        let rows: Vec<(Vec<u32>, Vec<i64>)> = conversations
            .par_iter()
            .map(|conversation| {
                let ids = self.encode(conversation)?;
                let labels = self.mask_labels(&ids);
                Ok((ids, labels))
            })
            .collect::<Result<_>>()?;

        let batch_size = rows.len();
        let max_len = rows.iter().map(|(ids, _)| ids.len()).max().unwrap_or(0).max(2);
        let seq_len = max_len - 1;

        let mut inputs = Vec::with_capacity(batch_size * seq_len);
        let mut targets = Vec::with_capacity(batch_size * seq_len);
        let mut mask = Vec::with_capacity(batch_size * seq_len);

        for (ids, labels) in &rows {
            let n = ids.len();
            if n < 2 {
                inputs.extend(std::iter::repeat_n(0u32, seq_len));
                targets.extend(std::iter::repeat_n(0u32, seq_len));
                mask.extend(std::iter::repeat_n(0f32, seq_len));
                continue;
            }

            inputs.extend_from_slice(&ids[..n - 1]);
            targets.extend_from_slice(&ids[1..]);
            mask.extend(
                labels[1..]
                    .iter()
                    .map(|&l| if l == IGNORE_INDEX { 0f32 } else { 1f32 }),
            );

            let pad = seq_len - (n - 1);
            inputs.extend(std::iter::repeat_n(0u32, pad));
            targets.extend(std::iter::repeat_n(0u32, pad));
            mask.extend(std::iter::repeat_n(0f32, pad));
        }

        Ok(Batch {
            inputs: Tensor::from_vec(inputs, (batch_size, seq_len), device)?,
            targets: Tensor::from_vec(targets, (batch_size, seq_len), device)?,
            mask: Tensor::from_vec(mask, (batch_size, seq_len), device)?,
        })
    }
}

fn find_last_subsequence(haystack: &[u32], needle: &[u32]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Message;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;
    use tokenizers::pre_tokenizers::PreTokenizerWrapper;
    use tokenizers::AddedToken;

    const WORDS: &[&str] = &[
        "[UNK]", "user", "assistant", "system", "Hello", "there", "How", "are", "you", "Fine",
        "thanks", "Good", "?", "!", ".",
    ];

    fn test_tokenizer() -> Tokenizer {
        let vocab = WORDS
            .iter()
            .enumerate()
            .map(|(i, w)| ((*w).to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .expect("word-level model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(PreTokenizerWrapper::Whitespace(Whitespace {})));
        tokenizer.add_special_tokens(&[
            AddedToken::from(String::from("<|im_start|>"), true),
            AddedToken::from(String::from("<|im_end|>"), true),
        ]);
        tokenizer
    }

    fn collator(max_seq_len: usize) -> CompletionOnlyCollator {
        let template = ChatTemplate::chatml();
        CompletionOnlyCollator::new(
            &template.assistant_start(),
            test_tokenizer(),
            template,
            max_seq_len,
        )
        .expect("collator")
    }

    fn conv(turns: &[(&str, &str)]) -> Conversation {
        Conversation {
            messages: turns
                .iter()
                .map(|(role, content)| Message {
                    role: (*role).to_string(),
                    content: (*content).to_string(),
                })
                .collect(),
        }
    }

    fn id(tokenizer: &Tokenizer, token: &str) -> i64 {
        i64::from(tokenizer.token_to_id(token).expect("known token"))
    }

    #[test]
    fn masks_prompt_through_end_of_marker() -> Result<()> {
        let collator = collator(1024);
        let example = conv(&[("user", "Hello there"), ("assistant", "Fine thanks")]);

        let ids = collator.encode(&example)?;
        let labels = collator.mask_labels(&ids);

        // [im_start, user, Hello, there, im_end, im_start, assistant, Fine, thanks, im_end]
        let marker_end = 7;
        for (i, label) in labels.iter().enumerate() {
            if i < marker_end {
                assert_eq!(*label, IGNORE_INDEX, "position {} should be ignored", i);
            } else {
                assert_eq!(*label, i64::from(ids[i]), "position {} should be kept", i);
            }
        }
        let tokenizer = test_tokenizer();
        assert_eq!(labels[marker_end], id(&tokenizer, "Fine"));
        Ok(())
    }

    #[test]
    fn masks_relative_to_last_marker_occurrence() -> Result<()> {
        let collator = collator(1024);
        let example = conv(&[
            ("user", "Hello"),
            ("assistant", "Good"),
            ("user", "How are you ?"),
            ("assistant", "Fine thanks !"),
        ]);

        let ids = collator.encode(&example)?;
        let labels = collator.mask_labels(&ids);
        let tokenizer = test_tokenizer();

        // The first assistant turn is context; only the final response trains.
        let good = id(&tokenizer, "Good");
        let fine = id(&tokenizer, "Fine");
        assert!(!labels.contains(&good));
        assert!(labels.contains(&fine));

        let first_kept = labels.iter().position(|&l| l != IGNORE_INDEX).unwrap();
        assert_eq!(labels[first_kept], fine);
        Ok(())
    }

    #[test]
    fn missing_marker_masks_everything() -> Result<()> {
        let collator = collator(1024);
        let example = conv(&[("user", "Hello there")]);

        let ids = collator.encode(&example)?;
        let labels = collator.mask_labels(&ids);
        assert!(labels.iter().all(|&l| l == IGNORE_INDEX));
        Ok(())
    }

    #[test]
    fn truncated_marker_masks_everything() -> Result<()> {
        // The cap cuts the sequence before the assistant turn starts.
        let collator = collator(4);
        let example = conv(&[("user", "Hello there"), ("assistant", "Fine")]);

        let ids = collator.encode(&example)?;
        assert_eq!(ids.len(), 4);
        let labels = collator.mask_labels(&ids);
        assert!(labels.iter().all(|&l| l == IGNORE_INDEX));
        Ok(())
    }

    #[test]
    fn collate_shifts_and_pads() -> Result<()> {
        let collator = collator(1024);
        let tokenizer = test_tokenizer();
        let batch = collator.collate(
            &[
                conv(&[("user", "Hello there"), ("assistant", "Fine thanks")]),
                conv(&[("user", "Hello"), ("assistant", "Good")]),
            ],
            &Device::Cpu,
        )?;

        // Longest example has 10 tokens -> 9 shifted positions.
        assert_eq!(batch.inputs.dims2()?, (2, 9));
        assert_eq!(batch.targets.dims2()?, (2, 9));

        let targets = batch.targets.to_vec2::<u32>()?;
        let mask = batch.mask.to_vec2::<f32>()?;

        // Row 0: first trainable target is the first response token.
        let fine = id(&tokenizer, "Fine") as u32;
        let first_on = mask[0].iter().position(|&m| m == 1.0).unwrap();
        assert_eq!(targets[0][first_on], fine);

        // Row 1 is shorter: its tail is padding with a zero mask.
        assert_eq!(mask[1][8], 0.0);
        assert_eq!(targets[1][8], 0);
        Ok(())
    }
}
