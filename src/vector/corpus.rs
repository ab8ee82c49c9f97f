//! Corpus input: JSONL records, lazy batching, partitioning and id mapping.
//!
//! The corpus is a finite stream read once per pass. Records keep their
//! stream order everywhere, which is what makes `DocumentId(i)` the i-th
//! record of the corpus and position `i` of the id mapping.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CorpusConfig;
use crate::error::{ErrorContext, IndexError, IndexResult};
use crate::vector::atomic::write_atomically;
use crate::vector::types::{DocumentId, IdRange, PartitionIndex};

/// One corpus line.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusRecord {
    pub external_id: ExternalId,
    pub text: String,
}

/// Identifier of a document outside the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalId {
    Int(i64),
    Text(String),
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
        }
    }
}

/// Reads a JSONL corpus.
#[derive(Debug, Clone)]
pub struct CorpusReader {
    path: PathBuf,
    text_field: String,
    id_field: String,
}

impl CorpusReader {
    pub fn new(
        path: impl Into<PathBuf>,
        text_field: impl Into<String>,
        id_field: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            text_field: text_field.into(),
            id_field: id_field.into(),
        }
    }

    /// Builds a reader from the `[corpus]` settings.
    pub fn from_config(config: &CorpusConfig) -> IndexResult<Self> {
        let path = config.path.clone().ok_or_else(|| IndexError::InvalidConfig {
            reason: "corpus.path is not set".to_string(),
        })?;
        Ok(Self::new(path, &config.text_field, &config.id_field))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a new pass over the corpus.
    pub fn records(&self) -> IndexResult<Records> {
        let file = File::open(&self.path).read_context(&self.path)?;
        Ok(Records {
            lines: BufReader::new(file).lines(),
            line_number: 0,
            records_read: 0,
            path: self.path.clone(),
            text_field: self.text_field.clone(),
            id_field: self.id_field.clone(),
        })
    }

    /// Starts a new pass yielding only the texts to encode.
    pub fn texts(&self) -> IndexResult<impl Iterator<Item = IndexResult<String>> + use<>> {
        Ok(self.records()?.map(|r| r.map(|record| record.text)))
    }
}

/// Single-pass iterator over corpus records. Blank lines are skipped.
pub struct Records {
    lines: Lines<BufReader<File>>,
    line_number: usize,
    records_read: u64,
    path: PathBuf,
    text_field: String,
    id_field: String,
}

impl Records {
    fn parse(&self, line: &str) -> IndexResult<CorpusRecord> {
        let malformed = |reason: String| IndexError::Serialization {
            path: self.path.clone(),
            reason: format!("line {}: {reason}", self.line_number),
        };

        let value: Value = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
        let text = match value.get(&self.text_field) {
            Some(Value::String(text)) => text.clone(),
            _ => return Err(malformed(format!("missing string field '{}'", self.text_field))),
        };
        let external_id = match value.get(&self.id_field) {
            Some(Value::String(id)) => ExternalId::Text(id.clone()),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(id) => ExternalId::Int(id),
                None => ExternalId::Text(n.to_string()),
            },
            // Records without an id are addressed by their position
            None => ExternalId::Int(self.records_read as i64),
            Some(other) => return Err(malformed(format!("unsupported id value {other}"))),
        };
        Ok(CorpusRecord { external_id, text })
    }
}

impl Iterator for Records {
    type Item = IndexResult<CorpusRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(source) => {
                    return Some(Err(IndexError::FileRead {
                        path: self.path.clone(),
                        source,
                    }));
                }
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record = self.parse(&line);
            self.records_read += 1;
            return Some(record);
        }
    }
}

/// Groups an iterator into `Vec`s of at most `size` items, lazily.
#[derive(Debug)]
pub struct Batches<I> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for Batches<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
        if batch.is_empty() { None } else { Some(batch) }
    }
}

/// Adds [`BatchExt::batches`] to every iterator.
pub trait BatchExt: Iterator + Sized {
    /// `size` is clamped to at least 1.
    fn batches(self, size: usize) -> Batches<Self> {
        Batches {
            inner: self,
            size: size.max(1),
        }
    }
}

impl<I: Iterator> BatchExt for I {}

/// One partition of the corpus, ready for a shard builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub index: PartitionIndex,
    /// Id of the first item; the rest follow contiguously.
    pub base_id: DocumentId,
    pub items: Vec<String>,
}

impl Partition {
    pub fn id_range(&self) -> IdRange {
        IdRange::new(self.base_id, self.items.len() as u64)
    }
}

/// Cuts a text stream into partitions and assigns their base ids.
pub struct Partitions<I> {
    batches: Batches<I>,
    next_index: u32,
    next_base: u64,
}

impl<I> Iterator for Partitions<I>
where
    I: Iterator<Item = IndexResult<String>>,
{
    type Item = IndexResult<Partition>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = self.batches.next()?;
        let items = match batch.into_iter().collect::<IndexResult<Vec<String>>>() {
            Ok(items) => items,
            Err(e) => return Some(Err(e)),
        };
        let partition = Partition {
            index: PartitionIndex::new(self.next_index),
            base_id: DocumentId::new(self.next_base),
            items,
        };
        self.next_index += 1;
        self.next_base += partition.items.len() as u64;
        Some(Ok(partition))
    }
}

/// Partitions `texts` into chunks of `partition_size` (the last may be shorter).
pub fn partitions<I>(texts: I, partition_size: usize) -> Partitions<I::IntoIter>
where
    I: IntoIterator<Item = IndexResult<String>>,
{
    Partitions {
        batches: texts.into_iter().batches(partition_size),
        next_index: 0,
        next_base: 0,
    }
}

/// Internal document id to external id, in corpus order.
///
/// Stored as a JSON array where position `i` holds the external id of
/// `DocumentId(i)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMapping {
    ids: Vec<ExternalId>,
}

impl IdMapping {
    pub fn new(ids: Vec<ExternalId>) -> Self {
        Self { ids }
    }

    /// Reads the external id of every record, in stream order.
    pub fn build_from_corpus(reader: &CorpusReader) -> IndexResult<Self> {
        let ids = reader
            .records()?
            .map(|r| r.map(|record| record.external_id))
            .collect::<IndexResult<Vec<_>>>()?;
        tracing::info!("Built id mapping with {} entries", ids.len());
        Ok(Self { ids })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, id: DocumentId) -> Option<&ExternalId> {
        usize::try_from(id.get()).ok().and_then(|i| self.ids.get(i))
    }

    pub fn save(&self, path: &Path) -> IndexResult<()> {
        write_atomically(path, |w| {
            serde_json::to_writer(&mut *w, &self.ids).map_err(std::io::Error::other)?;
            w.flush()
        })
    }

    pub fn load(path: &Path) -> IndexResult<Self> {
        let file = File::open(path).read_context(path)?;
        let ids: Vec<ExternalId> = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            IndexError::Serialization {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self { ids })
    }
}
