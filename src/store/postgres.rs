use super::{
    like_pattern, CatalogStore, ExportSource, Locale, NewTranslation, Page, PageRequest,
    StoreError, TranslationFilter, TranslationPatch, TranslationRecord, UpdateOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

const TEXTS_FOR_IDS: &str = "SELECT lt.translation_id, l.code, lt.translated_text
     FROM language_translations lt
     JOIN languages l ON l.id = lt.language_id
     WHERE lt.translation_id = ANY($1)";

const TAGS_FOR_IDS: &str = "SELECT tt.translation_id, tg.name
     FROM translation_tags tt
     JOIN tags tg ON tg.id = tt.tag_id
     WHERE tt.translation_id = ANY($1)
     ORDER BY tg.name";

const TRANSLATION_COLUMNS: &str = "t.id, t.key, t.default_value, t.created_at, t.updated_at";

#[derive(Debug, FromRow)]
struct TranslationRow {
    id: i64,
    key: String,
    default_value: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct LocaleRow {
    id: i64,
    code: String,
    name: String,
}

impl From<LocaleRow> for Locale {
    fn from(row: LocaleRow) -> Self {
        Self {
            id: row.id,
            code: row.code,
            name: row.name,
        }
    }
}

/// PostgreSQL-backed catalog.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Open a connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Insert a batch of translations in one transaction, bypassing
    /// per-record validation. Used by the seeder for large catalogs.
    ///
    /// Rows go in with multi-row inserts; keys that already exist are
    /// skipped along with their texts and tags.
    pub async fn bulk_insert(&self, batch: &[NewTranslation]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let inserted: HashMap<String, i64> = insert_translations_query(batch)
            .build_query_as::<(i64, String)>()
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|(id, key)| (key, id))
            .collect();

        let locale_ids: HashMap<String, i64> =
            sqlx::query_as::<_, (String, i64)>("SELECT code, id FROM languages")
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();
        let tag_ids: HashMap<String, i64> =
            sqlx::query_as::<_, (String, i64)>("SELECT name, id FROM tags")
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();

        let (texts, tags) = bulk_rows(batch, &inserted, &locale_ids, &tag_ids)?;

        for chunk in texts.chunks(ROWS_PER_INSERT) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO language_translations (language_id, translation_id, translated_text) ",
            );
            query.push_values(chunk, |mut row, (language_id, translation_id, text)| {
                row.push_bind(*language_id)
                    .push_bind(*translation_id)
                    .push_bind(text.clone());
            });
            query.push(" ON CONFLICT (language_id, translation_id) DO NOTHING");
            query.build().execute(&mut *tx).await?;
        }

        for chunk in tags.chunks(ROWS_PER_INSERT) {
            let mut query =
                QueryBuilder::<Postgres>::new("INSERT INTO translation_tags (translation_id, tag_id) ");
            query.push_values(chunk, |mut row, (translation_id, tag_id)| {
                row.push_bind(*translation_id).push_bind(*tag_id);
            });
            query.push(" ON CONFLICT DO NOTHING");
            query.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(
            "Bulk inserted {} translations, {} texts, {} tag links",
            inserted.len(),
            texts.len(),
            tags.len()
        );
        Ok(inserted.len() as u64)
    }

    /// Attach texts and tags to bare translation rows.
    async fn hydrate(&self, rows: Vec<TranslationRow>) -> Result<Vec<TranslationRecord>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();

        let (texts, tags) = futures::try_join!(
            sqlx::query_as::<_, (i64, String, String)>(TEXTS_FOR_IDS)
                .bind(&ids[..])
                .fetch_all(&self.pool),
            sqlx::query_as::<_, (i64, String)>(TAGS_FOR_IDS)
                .bind(&ids[..])
                .fetch_all(&self.pool),
        )?;

        Ok(assemble(rows, texts, tags))
    }
}

/// Load one translation inside an open transaction.
async fn load_in(
    conn: &mut PgConnection,
    id: i64,
    for_update: bool,
) -> Result<Option<TranslationRecord>, StoreError> {
    let sql = if for_update {
        format!("SELECT {TRANSLATION_COLUMNS} FROM translations t WHERE t.id = $1 FOR UPDATE")
    } else {
        format!("SELECT {TRANSLATION_COLUMNS} FROM translations t WHERE t.id = $1")
    };
    let Some(row) = sqlx::query_as::<_, TranslationRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };

    let ids = [id];
    let texts = sqlx::query_as::<_, (i64, String, String)>(TEXTS_FOR_IDS)
        .bind(&ids[..])
        .fetch_all(&mut *conn)
        .await?;
    let tags = sqlx::query_as::<_, (i64, String)>(TAGS_FOR_IDS)
        .bind(&ids[..])
        .fetch_all(&mut *conn)
        .await?;

    Ok(assemble(vec![row], texts, tags).pop())
}

/// Replace the translation's texts with `texts`. Codes without a matching
/// locale are skipped by the join.
async fn sync_texts(
    conn: &mut PgConnection,
    translation_id: i64,
    texts: &BTreeMap<String, String>,
) -> Result<(), StoreError> {
    let codes: Vec<String> = texts.keys().cloned().collect();

    sqlx::query(
        "DELETE FROM language_translations lt
         USING languages l
         WHERE lt.language_id = l.id
           AND lt.translation_id = $1
           AND NOT (l.code = ANY($2))",
    )
    .bind(translation_id)
    .bind(&codes[..])
    .execute(&mut *conn)
    .await?;

    for (code, text) in texts {
        sqlx::query(
            "INSERT INTO language_translations (language_id, translation_id, translated_text)
             SELECT l.id, $2, $3 FROM languages l WHERE l.code = $1
             ON CONFLICT (language_id, translation_id)
             DO UPDATE SET translated_text = EXCLUDED.translated_text, updated_at = NOW()",
        )
        .bind(code)
        .bind(translation_id)
        .bind(text)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Replace the translation's tags. Every name must exist.
async fn sync_tags(
    conn: &mut PgConnection,
    translation_id: i64,
    tags: &[String],
) -> Result<(), StoreError> {
    let found: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM tags WHERE name = ANY($1)")
        .bind(tags)
        .fetch_all(&mut *conn)
        .await?;

    let missing: Vec<String> = tags
        .iter()
        .filter(|name| !found.iter().any(|(_, found_name)| found_name == *name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(StoreError::UnknownTags(missing));
    }

    sqlx::query("DELETE FROM translation_tags WHERE translation_id = $1")
        .bind(translation_id)
        .execute(&mut *conn)
        .await?;

    for (tag_id, _) in found {
        sqlx::query(
            "INSERT INTO translation_tags (translation_id, tag_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(translation_id)
        .bind(tag_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Rows per multi-row insert; three binds each stays far below the
/// protocol's 65535 parameter limit.
const ROWS_PER_INSERT: usize = 5000;

fn insert_translations_query(batch: &[NewTranslation]) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("INSERT INTO translations (key, default_value) ");
    query.push_values(batch, |mut row, new| {
        row.push_bind(new.key.clone())
            .push_bind(new.default_value.clone());
    });
    query.push(" ON CONFLICT (key) DO NOTHING RETURNING id, key");
    query
}

type TextRow = (i64, i64, String);
type TagRow = (i64, i64);

/// Text and tag link rows for the translations that were actually inserted.
/// Texts for unknown locales are dropped; unknown tags fail the batch.
fn bulk_rows(
    batch: &[NewTranslation],
    inserted: &HashMap<String, i64>,
    locale_ids: &HashMap<String, i64>,
    tag_ids: &HashMap<String, i64>,
) -> Result<(Vec<TextRow>, Vec<TagRow>), StoreError> {
    let mut texts = Vec::new();
    let mut tags = Vec::new();
    let mut missing = Vec::new();

    for new in batch {
        let Some(&translation_id) = inserted.get(&new.key) else {
            continue;
        };
        for (code, text) in &new.texts {
            if let Some(&language_id) = locale_ids.get(code) {
                texts.push((language_id, translation_id, text.clone()));
            }
        }
        for name in &new.tags {
            match tag_ids.get(name) {
                Some(&tag_id) => tags.push((translation_id, tag_id)),
                None => missing.push(name.clone()),
            }
        }
    }

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(StoreError::UnknownTags(missing));
    }
    Ok((texts, tags))
}

fn assemble(
    rows: Vec<TranslationRow>,
    texts: Vec<(i64, String, String)>,
    tags: Vec<(i64, String)>,
) -> Vec<TranslationRecord> {
    let mut texts_by_id: HashMap<i64, BTreeMap<String, String>> = HashMap::new();
    for (id, code, text) in texts {
        texts_by_id.entry(id).or_default().insert(code, text);
    }
    let mut tags_by_id: HashMap<i64, Vec<String>> = HashMap::new();
    for (id, name) in tags {
        tags_by_id.entry(id).or_default().push(name);
    }

    rows.into_iter()
        .map(|row| TranslationRecord {
            texts: texts_by_id.remove(&row.id).unwrap_or_default(),
            tags: tags_by_id.remove(&row.id).unwrap_or_default(),
            id: row.id,
            key: row.key,
            default_value: row.default_value,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
        .collect()
}

fn push_filters(query: &mut QueryBuilder<'_, Postgres>, filter: &TranslationFilter) {
    query.push(" WHERE TRUE");

    if let Some(tag) = &filter.tag {
        query
            .push(
                " AND EXISTS (SELECT 1 FROM translation_tags tt JOIN tags tg ON tg.id = tt.tag_id \
                 WHERE tt.translation_id = t.id AND tg.name = ",
            )
            .push_bind(tag.clone())
            .push(")");
    }

    if let Some(key) = &filter.key {
        query.push(" AND t.key ILIKE ").push_bind(like_pattern(key));
    }

    if let Some(content) = &filter.content {
        let pattern = like_pattern(content);
        query
            .push(" AND (t.default_value ILIKE ")
            .push_bind(pattern.clone())
            .push(
                " OR EXISTS (SELECT 1 FROM language_translations lt \
                 WHERE lt.translation_id = t.id AND lt.translated_text ILIKE ",
            )
            .push_bind(pattern)
            .push("))");
    }
}

/// Map a unique-constraint violation on `translations.key` to `DuplicateKey`.
fn duplicate_key(err: sqlx::Error, key: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::DuplicateKey(key.to_string())
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl ExportSource for PgCatalog {
    async fn find_locale(&self, code: &str) -> Result<Option<Locale>, StoreError> {
        let row = sqlx::query_as::<_, LocaleRow>("SELECT id, code, name FROM languages WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Locale::from))
    }

    async fn export_rows(&self, locale_id: i64) -> Result<Vec<(String, String)>, StoreError> {
        // Backed by the (language_id, translation_id) unique index and the
        // translations primary key.
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT t.key, lt.translated_text
             FROM language_translations lt
             JOIN translations t ON t.id = lt.translation_id
             WHERE lt.language_id = $1",
        )
        .bind(locale_id)
        .fetch_all(&self.pool)
        .await?;
        debug!("Export query for locale {} returned {} rows", locale_id, rows.len());
        Ok(rows)
    }
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn list_locales(&self) -> Result<Vec<Locale>, StoreError> {
        let rows = sqlx::query_as::<_, LocaleRow>("SELECT id, code, name FROM languages ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Locale::from).collect())
    }

    async fn list_tags(&self) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn list_translations(
        &self,
        filter: &TranslationFilter,
        page: PageRequest,
    ) -> Result<Page<TranslationRecord>, StoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM translations t");
        push_filters(&mut count, filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TRANSLATION_COLUMNS} FROM translations t"
        ));
        push_filters(&mut select, filter);
        select
            .push(" ORDER BY t.id LIMIT ")
            .push_bind(i64::from(page.per_page))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows = select.build_query_as::<TranslationRow>().fetch_all(&self.pool).await?;

        Ok(Page {
            items: self.hydrate(rows).await?,
            total: total.max(0) as u64,
            page: page.page,
            per_page: page.per_page,
        })
    }

    async fn get_translation(&self, id: i64) -> Result<Option<TranslationRecord>, StoreError> {
        let row = sqlx::query_as::<_, TranslationRow>(&format!(
            "SELECT {TRANSLATION_COLUMNS} FROM translations t WHERE t.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn create_translation(
        &self,
        new: NewTranslation,
    ) -> Result<TranslationRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO translations (key, default_value) VALUES ($1, $2) RETURNING id",
        )
        .bind(&new.key)
        .bind(&new.default_value)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| duplicate_key(e, &new.key))?;

        sync_texts(&mut tx, id, &new.texts).await?;
        sync_tags(&mut tx, id, &new.tags).await?;

        let record = load_in(&mut tx, id, false)
            .await?
            .ok_or_else(|| StoreError::Unavailable(format!("translation {} vanished", id)))?;
        tx.commit().await?;
        Ok(record)
    }

    async fn update_translation(
        &self,
        id: i64,
        patch: TranslationPatch,
    ) -> Result<Option<UpdateOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(before) = load_in(&mut tx, id, true).await? else {
            return Ok(None);
        };

        if patch.key.is_some() || patch.default_value.is_some() {
            sqlx::query(
                "UPDATE translations
                 SET key = COALESCE($2, key),
                     default_value = COALESCE($3, default_value),
                     updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(id)
            .bind(patch.key.as_deref())
            .bind(patch.default_value.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|e| duplicate_key(e, patch.key.as_deref().unwrap_or(&before.key)))?;
        }
        if let Some(texts) = &patch.texts {
            sync_texts(&mut tx, id, texts).await?;
        }
        if let Some(tags) = &patch.tags {
            sync_tags(&mut tx, id, tags).await?;
        }

        let after = load_in(&mut tx, id, false)
            .await?
            .ok_or_else(|| StoreError::Unavailable(format!("translation {} vanished", id)))?;
        tx.commit().await?;
        Ok(Some(UpdateOutcome { before, after }))
    }

    async fn delete_translation(&self, id: i64) -> Result<Option<TranslationRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Snapshot before the cascade removes the locale texts
        let Some(snapshot) = load_in(&mut tx, id, true).await? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM translations WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(snapshot))
    }

    async fn upsert_locale(&self, code: &str, name: &str) -> Result<Locale, StoreError> {
        let row = sqlx::query_as::<_, LocaleRow>(
            "INSERT INTO languages (code, name) VALUES ($1, $2)
             ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name, updated_at = NOW()
             RETURNING id, code, name",
        )
        .bind(code)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn upsert_tag(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO tags (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
