//! Chunk Store — the authoritative relational store (spec §4.D).
//!
//! Executes the three query shapes F needs (`semantic`, `fulltext`, metadata
//! fetch by id set) plus the ingest contract (`insert_document`,
//! `insert_chunks`, `update_document_metadata`, `delete_document_cascade`),
//! all idempotent at the `(document_id, chunk_index)` level.
//!
//! Backed by Postgres + pgvector, grounded on the original system's
//! `db.py`/`pgvector_utils.py` (no direct Rust precedent in the example pack
//! for a relational chunk store — the teacher only ever talked to LanceDB —
//! so this module is built fresh against `sqlx`, the async Postgres crate
//! most widely used across the broader example pack).

use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::config::VectorMetric;
use crate::error::{RagError, Result};
use crate::types::{Chunk, Document, Hit, ImageAsset, ImageHit, MetadataFilter, SourceType};
use crate::vector_lit::to_vec_literal;

pub struct ChunkStore {
    pool: PgPool,
    metric: VectorMetric,
}

#[derive(FromRow)]
struct DocumentRow {
    id: Uuid,
    user_id: Uuid,
    space_id: Option<Uuid>,
    source_path: String,
    source_type: String,
    title: String,
    metadata: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl ChunkStore {
    pub async fn connect(database_url: &str, min_connections: u32, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(RagError::from)?;
        Ok(Self {
            pool,
            metric: VectorMetric::Cosine,
        })
    }

    pub fn with_metric(mut self, metric: VectorMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Build over a pool owned elsewhere, so the relational store and
    /// conversation store can share one connection pool.
    pub fn from_pool(pool: PgPool, metric: VectorMetric) -> Self {
        Self { pool, metric }
    }

    fn metric_operator(&self) -> &'static str {
        match self.metric {
            VectorMetric::Cosine => "<=>",
            VectorMetric::L2 => "<->",
            VectorMetric::InnerProduct => "<#>",
        }
    }

    fn filter_clause(filter: &MetadataFilter, start_idx: usize) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        let mut idx = start_idx;
        if let Some(space_id) = filter.space_id {
            clauses.push(format!("d.space_id = ${idx}"));
            binds.push(space_id.to_string());
            idx += 1;
        }
        if let Some(source_path) = &filter.source_path {
            clauses.push(format!("d.source_path = ${idx}"));
            binds.push(source_path.clone());
            idx += 1;
        }
        let _ = idx;
        (clauses.join(" AND "), binds)
    }

    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (id, user_id, space_id, source_path, source_type, title, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title, metadata = EXCLUDED.metadata",
        )
        .bind(doc.id)
        .bind(doc.user_id)
        .bind(doc.space_id)
        .bind(&doc.source_path)
        .bind(format!("{:?}", doc.source_type).to_lowercase())
        .bind(&doc.title)
        .bind(serde_json::to_value(&doc.metadata).unwrap_or_default())
        .bind(doc.created_at)
        .execute(&self.pool)
        .await
        .map_err(RagError::from)?;
        Ok(())
    }

    /// Idempotent at the `(document_id, chunk_index)` level: re-inserting the
    /// same pair overwrites content rather than duplicating it.
    pub async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            let embedding_literal = chunk.embedding.as_deref().map(to_vec_literal);
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, content, content_tsv, content_chars, embedding, embedding_model, created_at)
                 VALUES ($1, $2, $3, $4, to_tsvector('english', $4), $5, $6::vector, $7, $8)
                 ON CONFLICT (document_id, chunk_index) DO UPDATE
                   SET content = EXCLUDED.content,
                       content_tsv = EXCLUDED.content_tsv,
                       content_chars = EXCLUDED.content_chars,
                       embedding = EXCLUDED.embedding,
                       embedding_model = EXCLUDED.embedding_model",
            )
            .bind(chunk.id)
            .bind(chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.content_chars)
            .bind(embedding_literal)
            .bind(&chunk.embedding_model)
            .bind(chunk.created_at)
            .execute(&self.pool)
            .await
            .map_err(RagError::from)?;
        }
        Ok(())
    }

    pub async fn update_document_metadata(
        &self,
        document_id: Uuid,
        metadata: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        sqlx::query("UPDATE documents SET metadata = $2 WHERE id = $1")
            .bind(document_id)
            .bind(serde_json::to_value(metadata).unwrap_or_default())
            .execute(&self.pool)
            .await
            .map_err(RagError::from)?;
        Ok(())
    }

    /// Deletes the document, its chunks, and its image assets in one
    /// transaction. Secondary-index mirroring and revision bumps happen
    /// best-effort after commit, at the caller (retrieval engine) level.
    pub async fn delete_document_cascade(&self, document_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(RagError::from)?;
        let result = sqlx::query("DELETE FROM documents WHERE id = $1 AND user_id = $2")
            .bind(document_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::from)?;
        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(RagError::NotFound("document not found".to_string()));
        }
        sqlx::query("DELETE FROM chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::from)?;
        sqlx::query("DELETE FROM image_assets WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::from)?;
        tx.commit().await.map_err(RagError::from)?;
        Ok(())
    }

    /// `SELECT ... ORDER BY embedding <metric-op> vec LIMIT k` with
    /// `SET LOCAL ann_probes` established before the query, per §4.D. When
    /// chunks are ingested without stored embeddings, returns empty and logs
    /// a warning — the secondary index is authoritative for vectors in that
    /// deployment shape.
    pub async fn semantic(
        &self,
        query_vector: &[f32],
        k: usize,
        probes: Option<u32>,
        user_id: Uuid,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let mut tx = self.pool.begin().await.map_err(RagError::from)?;
        if let Some(probes) = probes {
            sqlx::query(&format!("SET LOCAL ivfflat.probes = {probes}"))
                .execute(&mut *tx)
                .await
                .map_err(RagError::from)?;
        }

        let (extra, binds) = Self::filter_clause(filter, 4);
        let where_clause = if extra.is_empty() {
            String::new()
        } else {
            format!(" AND {extra}")
        };
        let op = self.metric_operator();
        let sql = format!(
            "SELECT c.id as chunk_id, c.document_id, c.chunk_index, c.content,
                    d.source_path, d.source_type, d.title,
                    (c.embedding {op} $1::vector) as distance
             FROM chunks c JOIN documents d ON d.id = c.document_id
             WHERE d.user_id = $2 AND c.embedding IS NOT NULL{where_clause}
             ORDER BY c.embedding {op} $1::vector
             LIMIT $3"
        );
        let mut q = sqlx::query(&sql)
            .bind(to_vec_literal(query_vector))
            .bind(user_id)
            .bind(k as i64);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&mut *tx).await.map_err(RagError::from)?;
        tx.commit().await.map_err(RagError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| Hit {
                chunk_id: row.try_get("chunk_id").ok(),
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                content: row.get("content"),
                file_name: row.get("source_path"),
                file_type: SourceType::from_extension(
                    row.try_get::<String, _>("source_type").unwrap_or_default().as_str(),
                ),
                title: row.get("title"),
                distance: row.try_get::<f64, _>("distance").ok().map(|d| d as f32),
                rank: None,
            })
            .collect())
    }

    /// `plainto_tsquery`/`ts_rank_cd` full-text search.
    pub async fn fulltext(
        &self,
        query: &str,
        k: usize,
        user_id: Uuid,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let (extra, binds) = Self::filter_clause(filter, 4);
        let where_clause = if extra.is_empty() {
            String::new()
        } else {
            format!(" AND {extra}")
        };
        let sql = format!(
            "SELECT c.id as chunk_id, c.document_id, c.chunk_index, c.content,
                    d.source_path, d.source_type, d.title,
                    ts_rank_cd(c.content_tsv, plainto_tsquery('english', $1)) as rank
             FROM chunks c JOIN documents d ON d.id = c.document_id
             WHERE d.user_id = $2 AND c.content_tsv @@ plainto_tsquery('english', $1){where_clause}
             ORDER BY rank DESC
             LIMIT $3"
        );
        let mut q = sqlx::query(&sql).bind(query).bind(user_id).bind(k as i64);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(RagError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| Hit {
                chunk_id: row.try_get("chunk_id").ok(),
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                content: row.get("content"),
                file_name: row.get("source_path"),
                file_type: SourceType::from_extension(
                    row.try_get::<String, _>("source_type").unwrap_or_default().as_str(),
                ),
                title: row.get("title"),
                distance: None,
                rank: row.try_get::<f32, _>("rank").ok(),
            })
            .collect())
    }

    /// Idempotent upsert of an image asset, storing its embedding (when
    /// present) alongside its owning document.
    pub async fn insert_image_asset(&self, asset: &ImageAsset) -> Result<()> {
        let embedding_literal = asset.embedding.as_deref().map(to_vec_literal);
        sqlx::query(
            "INSERT INTO image_assets
                (id, document_id, user_id, space_id, file_path, thumbnail_path, width, height,
                 tags, caption, embedding, embedding_model, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11::vector,$12,$13)
             ON CONFLICT (id) DO UPDATE SET
                thumbnail_path = EXCLUDED.thumbnail_path,
                tags = EXCLUDED.tags,
                caption = EXCLUDED.caption,
                embedding = EXCLUDED.embedding,
                embedding_model = EXCLUDED.embedding_model",
        )
        .bind(asset.id)
        .bind(asset.document_id)
        .bind(asset.user_id)
        .bind(asset.space_id)
        .bind(&asset.file_path)
        .bind(&asset.thumbnail_path)
        .bind(asset.width)
        .bind(asset.height)
        .bind(&asset.tags)
        .bind(&asset.caption)
        .bind(embedding_literal)
        .bind(&asset.embedding_model)
        .bind(asset.created_at)
        .execute(&self.pool)
        .await
        .map_err(RagError::from)?;
        Ok(())
    }

    /// Relational fallback for image search (§4.F): ANN over
    /// `image_assets.embedding` when a vector is available, else
    /// ILIKE/tsrank over `caption` when only lexical text is given.
    /// `tags`, when non-empty, narrows results via array overlap.
    pub async fn image_search(
        &self,
        query_vector: Option<&[f32]>,
        query_text: Option<&str>,
        tags: &[String],
        k: usize,
        user_id: Uuid,
        space_id: Option<Uuid>,
    ) -> Result<Vec<ImageHit>> {
        let mut clauses = vec!["user_id = $1".to_string()];
        let mut idx = 2;
        if space_id.is_some() {
            clauses.push(format!("space_id = ${idx}"));
            idx += 1;
        }
        if !tags.is_empty() {
            clauses.push(format!("tags && ${idx}"));
            idx += 1;
        }

        let rows = if let Some(vector) = query_vector {
            let order_idx = idx;
            let limit_idx = idx + 1;
            let op = self.metric_operator();
            let sql = format!(
                "SELECT id, document_id, user_id, space_id, file_path, thumbnail_path, tags, caption, created_at,
                        (embedding {op} ${order_idx}::vector) as distance
                 FROM image_assets WHERE {} AND embedding IS NOT NULL
                 ORDER BY embedding {op} ${order_idx}::vector
                 LIMIT ${limit_idx}",
                clauses.join(" AND ")
            );
            let mut q = sqlx::query(&sql).bind(user_id);
            if let Some(sid) = space_id {
                q = q.bind(sid);
            }
            if !tags.is_empty() {
                q = q.bind(tags);
            }
            q = q.bind(to_vec_literal(vector)).bind(k as i64);
            q.fetch_all(&self.pool).await.map_err(RagError::from)?
        } else if let Some(text) = query_text {
            let text_idx = idx;
            let limit_idx = idx + 1;
            let sql = format!(
                "SELECT id, document_id, user_id, space_id, file_path, thumbnail_path, tags, caption, created_at,
                        NULL::float8 as distance
                 FROM image_assets WHERE {} AND caption ILIKE ${text_idx}
                 ORDER BY created_at DESC
                 LIMIT ${limit_idx}",
                clauses.join(" AND ")
            );
            let mut q = sqlx::query(&sql).bind(user_id);
            if let Some(sid) = space_id {
                q = q.bind(sid);
            }
            if !tags.is_empty() {
                q = q.bind(tags);
            }
            q = q.bind(format!("%{text}%")).bind(k as i64);
            q.fetch_all(&self.pool).await.map_err(RagError::from)?
        } else {
            let limit_idx = idx;
            let sql = format!(
                "SELECT id, document_id, user_id, space_id, file_path, thumbnail_path, tags, caption, created_at,
                        NULL::float8 as distance
                 FROM image_assets WHERE {} ORDER BY created_at DESC LIMIT ${limit_idx}",
                clauses.join(" AND ")
            );
            let mut q = sqlx::query(&sql).bind(user_id);
            if let Some(sid) = space_id {
                q = q.bind(sid);
            }
            if !tags.is_empty() {
                q = q.bind(tags);
            }
            q = q.bind(k as i64);
            q.fetch_all(&self.pool).await.map_err(RagError::from)?
        };

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let distance: Option<f64> = row.try_get("distance").ok();
                ImageHit {
                    rank: i,
                    doc_id: row.get("document_id"),
                    image_id: row.get("id"),
                    file_path: row.get("file_path"),
                    thumbnail_path: row.get("thumbnail_path"),
                    caption: row.get("caption"),
                    tags: row.get("tags"),
                    score: distance.map(|d| 1.0 - (d as f32).clamp(0.0, 1.0)).unwrap_or(0.0),
                }
            })
            .collect())
    }

    pub async fn documents_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT id, user_id, space_id, source_path, source_type, title, metadata, created_at
             FROM documents WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(RagError::from)?;

        Ok(rows
            .into_iter()
            .map(|r| Document {
                id: r.id,
                user_id: r.user_id,
                space_id: r.space_id,
                source_path: r.source_path.clone(),
                source_type: SourceType::from_extension(&r.source_type),
                title: r.title,
                metadata: serde_json::from_value(r.metadata).unwrap_or_default(),
                created_at: r.created_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_clause_with_no_fields_is_empty() {
        let (clause, binds) = ChunkStore::filter_clause(&MetadataFilter::default(), 3);
        assert!(clause.is_empty());
        assert!(binds.is_empty());
    }

    #[test]
    fn filter_clause_includes_space_id() {
        let filter = MetadataFilter {
            space_id: Some(Uuid::nil()),
            ..Default::default()
        };
        let (clause, binds) = ChunkStore::filter_clause(&filter, 3);
        assert_eq!(clause, "d.space_id = $3");
        assert_eq!(binds.len(), 1);
    }
}
