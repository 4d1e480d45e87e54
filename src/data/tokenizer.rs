//! Atom-level SMILES tokenization over an external vocabulary

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Bracket atoms, two-letter halogens, organic subset atoms, bonds, branches and ring closures
const SMILES_PATTERN: &str =
    r"(\[[^\]]+\]|Br?|Cl?|N|O|S|P|F|I|b|c|n|o|s|p|\(|\)|\.|=|#|-|\+|\\|/|:|~|@|\?|>|\*|\$|%[0-9]{2}|[0-9])";

pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";
pub const PAD_TOKEN: &str = "<pad>";
pub const UNK_TOKEN: &str = "<unk>";

/// Vocabulary file expected inside the pretrained model directory
pub const VOCAB_FILE_NAME: &str = "vocab.json";

/// Compile the SMILES token pattern
pub fn smiles_regex() -> Result<Regex> {
    Regex::new(SMILES_PATTERN).context("Invalid SMILES token pattern")
}

/// Split a SMILES string into atom-level tokens
pub fn split_smiles<'a>(regex: &Regex, smiles: &'a str) -> Vec<&'a str> {
    regex.find_iter(smiles).map(|m| m.as_str()).collect()
}

/// Whether a token denotes an atom rather than a bond, branch or ring closure
pub fn is_atom_token(token: &str) -> bool {
    token.starts_with('[') || token.chars().next().map_or(false, |c| c.is_ascii_alphabetic())
}

/// SMILES tokenizer producing `<s> ... </s>` id sequences
#[derive(Debug, Clone)]
pub struct SmilesTokenizer {
    vocab: HashMap<String, u32>,
    regex: Regex,
    max_length: usize,
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
    unk_id: u32,
}

impl SmilesTokenizer {
    /// Create tokenizer from a token-to-id map
    pub fn new(vocab: HashMap<String, u32>, max_length: usize) -> Result<Self> {
        if max_length < 3 {
            bail!("max_length must leave room for special tokens, got {}", max_length);
        }
        let special = |token: &str| -> Result<u32> {
            vocab
                .get(token)
                .copied()
                .with_context(|| format!("Vocabulary is missing special token {}", token))
        };

        Ok(Self {
            bos_id: special(BOS_TOKEN)?,
            eos_id: special(EOS_TOKEN)?,
            pad_id: special(PAD_TOKEN)?,
            unk_id: special(UNK_TOKEN)?,
            regex: smiles_regex()?,
            vocab,
            max_length,
        })
    }

    /// Load `vocab.json` from a pretrained model directory
    pub fn from_pretrained<P: AsRef<Path>>(dir: P, max_length: usize) -> Result<Self> {
        let path = dir.as_ref().join(VOCAB_FILE_NAME);
        info!("Loading tokenizer vocabulary from {:?}", path);

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read vocabulary {:?}", path))?;
        let vocab: HashMap<String, u32> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse vocabulary {:?}", path))?;

        debug!("Vocabulary size: {}", vocab.len());
        Self::new(vocab, max_length)
    }

    /// Encode a SMILES string, truncating to `max_length`
    pub fn encode(&self, smiles: &str) -> Vec<u32> {
        let mut ids = Vec::with_capacity(self.max_length);
        ids.push(self.bos_id);
        ids.extend(
            split_smiles(&self.regex, smiles)
                .into_iter()
                .take(self.max_length - 2)
                .map(|token| self.vocab.get(token).copied().unwrap_or(self.unk_id)),
        );
        ids.push(self.eos_id);
        ids
    }

    /// Size of the embedding table needed for this vocabulary
    pub fn vocab_size(&self) -> usize {
        self.vocab.values().copied().max().map_or(0, |m| m as usize + 1)
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_vocab() -> HashMap<String, u32> {
        ["<s>", "<pad>", "</s>", "<unk>", "C", "O", "N", "c", "1", "(", ")", "="]
            .iter()
            .enumerate()
            .map(|(i, t)| (t.to_string(), i as u32))
            .collect()
    }

    #[test]
    fn test_split_smiles() {
        let regex = smiles_regex().unwrap();
        assert_eq!(split_smiles(&regex, "CC(=O)Cl"), vec!["C", "C", "(", "=", "O", ")", "Cl"]);
        assert_eq!(split_smiles(&regex, "[NH4+]Br"), vec!["[NH4+]", "Br"]);
        assert_eq!(split_smiles(&regex, "c1ccccc1"), vec!["c", "1", "c", "c", "c", "c", "c", "1"]);
    }

    #[test]
    fn test_atom_tokens() {
        assert!(is_atom_token("Cl"));
        assert!(is_atom_token("[nH]"));
        assert!(!is_atom_token("="));
        assert!(!is_atom_token("1"));
    }

    #[test]
    fn test_encode() {
        let tokenizer = SmilesTokenizer::new(test_vocab(), 16).unwrap();
        assert_eq!(tokenizer.encode("CCO"), vec![0, 4, 4, 5, 2]);
        // Br is not in the vocabulary
        assert_eq!(tokenizer.encode("CBr"), vec![0, 4, 3, 2]);
        assert_eq!(tokenizer.vocab_size(), 12);
        assert_eq!(tokenizer.pad_id(), 1);
    }

    #[test]
    fn test_truncation() {
        let tokenizer = SmilesTokenizer::new(test_vocab(), 4).unwrap();
        let ids = tokenizer.encode("CCCCCC");
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[3], 2);
    }

    #[test]
    fn test_missing_special_token() {
        let mut vocab = test_vocab();
        vocab.remove("<unk>");
        assert!(SmilesTokenizer::new(vocab, 16).is_err());
    }
}
