//! Vocabularies, token documents and count vectorization.
//!
//! The vectorizer is the shared, stateless adapter between the token
//! representation documents travel in and the count vectors the learner and
//! the evaluation engine consume. Tokens outside the vocabulary are
//! silently dropped; a vocabulary-width disagreement with a model state is
//! a configuration bug and surfaces as [`VocabularyMismatchError`].

use std::collections::HashMap;

use ndarray::Array2;
use thiserror::Error;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("batch has {found} vocabulary columns but the model was fit with {expected}")]
/// A count batch and a model state disagree on the vocabulary size.
///
/// This signals a configuration bug; no silent coercion is attempted.
pub struct VocabularyMismatchError {
    pub expected: usize,
    pub found: usize,
}

/// A fixed token-to-index mapping, immutable for the lifetime of a study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    index: HashMap<String, usize>,
}

impl Vocabulary {
    /// Builds a vocabulary from an explicit token-to-index mapping.
    pub fn new(index: HashMap<String, usize>) -> Self {
        Self { index }
    }

    /// Builds the stringified-index vocabulary `{"0": 0, ..., "size-1": size-1}`
    /// used by synthetic corpora, whose tokens are word indices.
    pub fn indexed(size: usize) -> Self {
        Self {
            index: (0..size).map(|i| (i.to_string(), i)).collect(),
        }
    }

    /// The vocabulary size `V`.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The index of `token`, or `None` if it is out of vocabulary.
    pub fn index_of(&self, token: &str) -> Option<usize> {
        self.index.get(token).copied()
    }
}

/// A multiset of tokens, immutable once generated.
///
/// Documents travel as whitespace-joined token sequences and are fit as
/// count vectors against a fixed [`Vocabulary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    tokens: Vec<String>,
}

impl Document {
    pub fn from_tokens(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    /// Splits a whitespace-joined token sequence back into a document.
    pub fn from_text(text: &str) -> Self {
        Self {
            tokens: text.split_whitespace().map(str::to_owned).collect(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The transport form: tokens joined by single spaces.
    pub fn to_text(&self) -> String {
        self.tokens.join(" ")
    }
}

/// Maps token documents to count vectors over a fixed vocabulary.
#[derive(Debug, Clone)]
pub struct Vectorizer {
    vocabulary: Vocabulary,
}

impl Vectorizer {
    pub fn new(vocabulary: Vocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Vectorizes `documents` into a `documents.len() × V` count matrix.
    ///
    /// Out-of-vocabulary tokens are dropped without error.
    pub fn vectorize(&self, documents: &[Document]) -> Array2<f64> {
        let v = self.vocabulary.len();
        let mut counts = Array2::<f64>::zeros((documents.len(), v));
        for (d, doc) in documents.iter().enumerate() {
            for token in doc.tokens() {
                if let Some(w) = self.vocabulary.index_of(token) {
                    counts[[d, w]] += 1.0;
                }
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectorize_counts_tokens() {
        let vectorizer = Vectorizer::new(Vocabulary::indexed(4));
        let docs = vec![
            Document::from_text("0 1 1 3 3 3"),
            Document::from_text("2"),
        ];
        let counts = vectorizer.vectorize(&docs);
        assert_eq!(counts.shape(), &[2, 4]);
        assert_eq!(counts.row(0).to_vec(), vec![1.0, 2.0, 0.0, 3.0]);
        assert_eq!(counts.row(1).to_vec(), vec![0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn out_of_vocabulary_tokens_are_dropped() {
        let vectorizer = Vectorizer::new(Vocabulary::indexed(2));
        let docs = vec![Document::from_text("0 17 frog 1 1")];
        let counts = vectorizer.vectorize(&docs);
        assert_eq!(counts.row(0).to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn document_round_trips_through_text() {
        let doc = Document::from_tokens(vec!["3".into(), "1".into(), "3".into()]);
        assert_eq!(Document::from_text(&doc.to_text()), doc);
    }
}
