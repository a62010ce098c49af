use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use serde_json::{Map, Value};
use tantivy::{Index, IndexWriter, TantivyDocument, schema::Field};

use crate::{
    error::{Error, Result},
    index::{ROW_FIELD, ROW_IDX_FIELD, build_schema, register_tokenizers},
};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Builds a split index from JSON rows, assigning row ids `0..` in the
/// order rows are added.
pub struct IndexBuilder {
    writer: IndexWriter,
    row_idx: Field,
    row: Field,
    columns: Vec<(String, Field)>,
    next_row_idx: u64,
}

impl IndexBuilder {
    /// Create an empty index in `dir`, with `columns` as searchable text.
    pub fn create(dir: &Path, columns: &[&str]) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let schema = build_schema(columns)?;
        let index = Index::create_in_dir(dir, schema.clone())?;
        register_tokenizers(&index);

        let mut fields = Vec::with_capacity(columns.len());
        for name in columns {
            fields.push((name.to_string(), schema.get_field(name)?));
        }

        Ok(Self {
            writer: index.writer(WRITER_HEAP_BYTES)?,
            row_idx: schema.get_field(ROW_IDX_FIELD)?,
            row: schema.get_field(ROW_FIELD)?,
            columns: fields,
            next_row_idx: 0,
        })
    }

    /// Add one row, returning its row id.
    ///
    /// Strings are indexed as-is, other non-null values by their JSON text.
    /// Missing and null columns are not indexed.
    pub fn add_row(&mut self, row: &Map<String, Value>) -> Result<u64> {
        let row_idx = self.next_row_idx;

        let mut doc = TantivyDocument::default();
        doc.add_u64(self.row_idx, row_idx);
        doc.add_text(self.row, serde_json::to_string(row)?);
        for (name, field) in &self.columns {
            match row.get(name) {
                None | Some(Value::Null) => {}
                Some(Value::String(text)) => doc.add_text(*field, text),
                Some(other) => doc.add_text(*field, other.to_string()),
            }
        }
        self.writer.add_document(doc)?;

        self.next_row_idx += 1;
        Ok(row_idx)
    }

    /// Commit every added row and wait for merges. Returns the row count.
    pub fn commit(mut self) -> Result<u64> {
        self.writer.commit()?;
        self.writer.wait_merging_threads()?;
        Ok(self.next_row_idx)
    }
}

impl std::fmt::Debug for IndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuilder")
            .field("next_row_idx", &self.next_row_idx)
            .finish_non_exhaustive()
    }
}

/// Pack an index directory into the tar archive served as the artifact.
pub fn pack(index_dir: &Path, archive: &Path) -> Result<()> {
    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut builder = tar::Builder::new(File::create(archive)?);
    builder.append_dir_all(".", index_dir)?;
    builder.into_inner()?.sync_all()?;
    Ok(())
}

/// Read a JSON Lines file into rows. Blank lines are skipped.
pub fn read_jsonl(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line)? {
            Value::Object(row) => rows.push(row),
            _ => {
                return Err(Error::InvalidParameter(format!(
                    "{}:{}: expected a JSON object",
                    path.display(),
                    lineno + 1
                )));
            }
        }
    }

    Ok(rows)
}

/// Build an index from `rows` in a scratch directory and pack it into
/// `archive`. Returns the number of rows indexed.
pub fn build_archive(
    rows: &[Map<String, Value>],
    columns: &[&str],
    archive: &Path,
) -> Result<u64> {
    let scratch = tempfile::tempdir()?;
    let mut builder = IndexBuilder::create(scratch.path(), columns)?;
    for row in rows {
        builder.add_row(row)?;
    }
    let num_rows = builder.commit()?;
    pack(scratch.path(), archive)?;

    tracing::info!(
        num_rows,
        archive = %archive.display(),
        "index archive built"
    );
    Ok(num_rows)
}
