//! Lexical full-text index over memory content.
//!
//! Only active items are indexed; soft-deleted and superseded items are
//! removed at transition time, so every hit is retrievable. All queries
//! carry a mandatory user term so results can never cross owners.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::doc;
use tantivy::query::{BooleanQuery, Occur, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, STORED, STRING, Schema, TEXT, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

#[derive(Debug, Clone)]
pub struct IndexableItem {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub category: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub item_id: String,
    pub score: f32,
}

pub struct TextIndex {
    index: Index,
    reader: IndexReader,
    writer: Arc<Mutex<IndexWriter>>,
    item_id_field: Field,
    user_id_field: Field,
    content_field: Field,
    category_field: Field,
    created_at_field: Field,
}

impl TextIndex {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create index dir: {}", path.display()))?;

        let schema = build_schema();
        let index = Index::open_in_dir(path).or_else(|_| Index::create_in_dir(path, schema))?;
        Self::from_index(index)
    }

    pub fn in_memory() -> Result<Self> {
        let schema = build_schema();
        let index = Index::create_in_ram(schema);
        Self::from_index(index)
    }

    pub fn doc_count(&self) -> Result<u64> {
        Ok(self.reader.searcher().num_docs())
    }

    pub fn index_item(&self, item: &IndexableItem) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.item_id_field, &item.id));

        let document = doc!(
            self.item_id_field => item.id.clone(),
            self.user_id_field => item.user_id.clone(),
            self.content_field => item.content.clone(),
            self.category_field => item.category.clone(),
            self.created_at_field => item.created_at,
        );

        writer.add_document(document)?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn remove_item(&self, item_id: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.item_id_field, item_id));
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Ranked full-text search scoped to one user, optionally one category.
    pub fn search(
        &self,
        query: &str,
        user_id: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let searcher = self.reader.searcher();

        let mut parser = QueryParser::for_index(&self.index, vec![self.content_field]);
        parser.set_conjunction_by_default();

        // Lenient parse: a free-form user query must not abort retrieval
        let (text_query, _errors) = parser.parse_query_lenient(query);
        let user_term = Term::from_field_text(self.user_id_field, user_id);
        let user_query = TermQuery::new(user_term, IndexRecordOption::Basic);

        let mut clauses: Vec<(Occur, Box<dyn tantivy::query::Query>)> = vec![
            (Occur::Must, Box::new(text_query)),
            (Occur::Must, Box::new(user_query)),
        ];

        if let Some(category) = category {
            let term = Term::from_field_text(self.category_field, category);
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
            ));
        }

        let combined = BooleanQuery::new(clauses);
        let top_docs = searcher.search(&combined, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let document: TantivyDocument = searcher.doc(address)?;
            let Some(value) = document.get_first(self.item_id_field) else {
                continue;
            };
            let Some(item_id) = value.as_str() else {
                continue;
            };
            hits.push(SearchHit {
                item_id: item_id.to_string(),
                score,
            });
        }

        Ok(hits)
    }

    pub fn rebuild<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = IndexableItem>,
    {
        let mut writer = self.writer.lock();
        writer.delete_all_documents()?;

        let mut count = 0usize;
        for item in items {
            let document = doc!(
                self.item_id_field => item.id,
                self.user_id_field => item.user_id,
                self.content_field => item.content,
                self.category_field => item.category,
                self.created_at_field => item.created_at,
            );
            writer.add_document(document)?;
            count += 1;
        }

        writer.commit()?;
        self.reader.reload()?;
        Ok(count)
    }

    fn from_index(index: Index) -> Result<Self> {
        let schema = index.schema();
        let item_id_field = schema
            .get_field("item_id")
            .context("missing item_id field in index schema")?;
        let user_id_field = schema
            .get_field("user_id")
            .context("missing user_id field in index schema")?;
        let content_field = schema
            .get_field("content")
            .context("missing content field in index schema")?;
        let category_field = schema
            .get_field("category")
            .context("missing category field in index schema")?;
        let created_at_field = schema
            .get_field("created_at")
            .context("missing created_at field in index schema")?;

        let writer = index.writer(50_000_000)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            item_id_field,
            user_id_field,
            content_field,
            category_field,
            created_at_field,
        })
    }
}

fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field("item_id", STRING | STORED);
    schema_builder.add_text_field("user_id", STRING);
    schema_builder.add_text_field("content", TEXT | STORED);
    schema_builder.add_text_field("category", STRING);
    schema_builder.add_i64_field("created_at", STORED);
    schema_builder.build()
}
