use std::{
    fs::File,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tantivy::{
    Index,
    IndexReader,
    Order,
    ReloadPolicy,
    TantivyDocument,
    Term,
    collector::{Count, TopDocs},
    query::{BooleanQuery, Occur, Query, TermQuery},
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
        TokenStream,
    },
};

use crate::error::{Error, Result};

/// Stable, monotonically increasing row identifier. Pages are ordered by it.
pub const ROW_IDX_FIELD: &str = "__row_idx";
/// The original row, stored as JSON text.
pub const ROW_FIELD: &str = "__row";
/// Tokenizer used by every searchable column.
pub const FTS_TOKENIZER: &str = "fts_en_stem";

/// Build the schema of an index whose searchable columns are `columns`.
pub fn build_schema(columns: &[&str]) -> Result<Schema> {
    let mut builder = Schema::builder();
    builder.add_u64_field(ROW_IDX_FIELD, INDEXED | STORED | FAST);
    builder.add_text_field(ROW_FIELD, STORED);

    let column_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(FTS_TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    for column in columns {
        if column.is_empty() || column.starts_with("__") {
            return Err(Error::InvalidParameter(format!(
                "invalid column name '{column}'"
            )));
        }
        builder.add_text_field(column, column_opts.clone());
    }

    Ok(builder.build())
}

pub fn register_tokenizers(index: &Index) {
    let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register(FTS_TOKENIZER, analyzer);
}

/// One matching row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub row_idx: u64,
    pub row: serde_json::Map<String, serde_json::Value>,
}

/// Total match count plus one window of matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub num_total_rows: u64,
    pub rows: Vec<Row>,
}

/// A read-only, locally cached split index.
pub struct IndexFile {
    index: Index,
    reader: IndexReader,
    row_idx: Field,
    row: Field,
    columns: Vec<Field>,
}

impl IndexFile {
    /// Open an index directory.
    pub fn open(dir: &Path) -> Result<Self> {
        let index = Index::open_in_dir(dir)?;
        register_tokenizers(&index);

        let schema = index.schema();
        let row_idx = schema.get_field(ROW_IDX_FIELD)?;
        let row = schema.get_field(ROW_FIELD)?;
        let columns = schema
            .fields()
            .filter_map(|(field, entry)| match entry.field_type() {
                FieldType::Str(opts)
                    if field != row && opts.get_indexing_options().is_some() =>
                {
                    Some(field)
                }
                _ => None,
            })
            .collect();

        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            row_idx,
            row,
            columns,
        })
    }

    /// Open an index shipped as a tar archive, unpacking it next to the
    /// archive on first use.
    pub fn open_archive(archive: &Path) -> Result<Self> {
        let dir = unpacked_dir(archive)?;
        if !dir.join("meta.json").is_file() {
            unpack(archive, &dir)?;
        }
        Self::open(&dir)
    }

    /// Rows whose relevance for `query` is non-null: the total count and the
    /// window `[offset, offset + length)` in ascending row id order.
    ///
    /// `query` is only ever analyzed into terms, never interpreted as query
    /// syntax.
    pub fn full_text_search(
        &self,
        query: &str,
        offset: usize,
        length: usize,
    ) -> Result<SearchPage> {
        let Some(query) = self.match_query(query)? else {
            return Ok(SearchPage {
                num_total_rows: 0,
                rows: vec![],
            });
        };
        let searcher = self.reader.searcher();

        if length == 0 {
            let count = searcher.search(&query, &Count)?;
            return Ok(SearchPage {
                num_total_rows: count as u64,
                rows: vec![],
            });
        }

        // Keeps at most `offset + length` candidates, never the match set.
        let window = TopDocs::with_limit(length)
            .and_offset(offset)
            .order_by_fast_field::<u64>(ROW_IDX_FIELD, Order::Asc);
        let (count, matches) = searcher.search(&query, &(Count, window))?;

        let mut rows = Vec::with_capacity(matches.len());
        for (row_idx, addr) in matches {
            let doc: TantivyDocument = searcher.doc(addr)?;
            let raw = doc.get_first(self.row).and_then(|v| v.as_str());
            let row = match raw {
                Some(json) => serde_json::from_str(json)?,
                None => serde_json::Map::new(),
            };
            rows.push(Row { row_idx, row });
        }

        tracing::debug!(
            num_total_rows = count,
            offset,
            length,
            "full text search"
        );
        Ok(SearchPage {
            num_total_rows: count as u64,
            rows,
        })
    }

    pub fn num_rows(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Any-term match over every searchable column, or `None` when the text
    /// has no indexable token.
    fn match_query(&self, text: &str) -> Result<Option<BooleanQuery>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        for &field in &self.columns {
            let mut analyzer = self.index.tokenizer_for_field(field)?;
            let mut stream = analyzer.token_stream(text);
            while stream.advance() {
                let term = Term::from_field_text(field, &stream.token().text);
                clauses.push((
                    Occur::Should,
                    Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs)),
                ));
            }
        }

        if clauses.is_empty() {
            return Ok(None);
        }
        Ok(Some(BooleanQuery::new(clauses)))
    }
}

impl std::fmt::Debug for IndexFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexFile")
            .field("row_idx", &self.row_idx)
            .finish_non_exhaustive()
    }
}

fn unpacked_dir(archive: &Path) -> Result<PathBuf> {
    let name = archive.file_name().ok_or_else(|| {
        Error::Unexpected(format!("not a file path: {}", archive.display()))
    })?;
    let mut dir_name = name.to_os_string();
    dir_name.push(".d");
    Ok(archive.with_file_name(dir_name))
}

/// Unpack into a private temporary directory, then rename into place. A
/// concurrent caller that wins the rename leaves us with nothing to do.
fn unpack(archive: &Path, dir: &Path) -> Result<()> {
    let parent = dir.parent().ok_or_else(|| {
        Error::Unexpected(format!("no parent for {}", dir.display()))
    })?;
    let staging = tempfile::TempDir::new_in(parent)?;
    tar::Archive::new(File::open(archive)?).unpack(staging.path())?;

    let staged = staging.keep();
    if let Err(e) = std::fs::rename(&staged, dir) {
        std::fs::remove_dir_all(&staged)?;
        if !dir.join("meta.json").is_file() {
            return Err(Error::Io(e));
        }
    }
    Ok(())
}
