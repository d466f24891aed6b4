//! Look/View catalog access
//!
//! The catalog is maintained by upstream workflows (CRUD, upload, pairing
//! UI); the engine reads it to plan. The save helpers exist for catalog
//! sync and test seeding.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use lookgen_common::{Error, Result};

use super::{placeholders, FILTER_CHUNK};
use crate::models::{Look, View, ViewKind};

/// Upsert a Look row
pub async fn save_look(pool: &SqlitePool, look: &Look) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO looks (look_id, name, talent_ref, first_seen_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(look_id) DO UPDATE SET
            name = excluded.name,
            talent_ref = excluded.talent_ref
        "#,
    )
    .bind(look.look_id.to_string())
    .bind(&look.name)
    .bind(&look.talent_ref)
    .bind(look.first_seen_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Upsert a View row
pub async fn save_view(pool: &SqlitePool, view: &View) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO views (view_id, look_id, kind, reference_image_url, has_crop, has_match)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(view_id) DO UPDATE SET
            reference_image_url = excluded.reference_image_url,
            has_crop = excluded.has_crop,
            has_match = excluded.has_match
        "#,
    )
    .bind(view.view_id.to_string())
    .bind(view.look_id.to_string())
    .bind(view.kind.as_str())
    .bind(&view.reference_image_url)
    .bind(view.has_crop as i64)
    .bind(view.has_match as i64)
    .execute(pool)
    .await?;

    Ok(())
}

fn look_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Look> {
    let look_id: String = row.get("look_id");
    let first_seen_at: String = row.get("first_seen_at");

    Ok(Look {
        look_id: Uuid::parse_str(&look_id)
            .map_err(|e| Error::Internal(format!("Failed to parse look_id: {}", e)))?,
        name: row.get("name"),
        talent_ref: row.get("talent_ref"),
        first_seen_at: chrono::DateTime::parse_from_rfc3339(&first_seen_at)
            .map_err(|e| Error::Internal(format!("Failed to parse first_seen_at: {}", e)))?
            .with_timezone(&chrono::Utc),
    })
}

fn view_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<View> {
    let view_id: String = row.get("view_id");
    let look_id: String = row.get("look_id");
    let kind: String = row.get("kind");

    Ok(View {
        view_id: Uuid::parse_str(&view_id)
            .map_err(|e| Error::Internal(format!("Failed to parse view_id: {}", e)))?,
        look_id: Uuid::parse_str(&look_id)
            .map_err(|e| Error::Internal(format!("Failed to parse look_id: {}", e)))?,
        kind: ViewKind::from_str(&kind)?,
        reference_image_url: row.get("reference_image_url"),
        has_crop: row.get::<i64, _>("has_crop") != 0,
        has_match: row.get::<i64, _>("has_match") != 0,
    })
}

/// Look up one View of a Look by kind (dispatch needs its reference image)
pub async fn view_for(pool: &SqlitePool, look_id: Uuid, kind: ViewKind) -> Result<Option<View>> {
    let row = sqlx::query("SELECT * FROM views WHERE look_id = ? AND kind = ? LIMIT 1")
        .bind(look_id.to_string())
        .bind(kind.as_str())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(view_from_row).transpose()
}

/// Load Looks by id set (chunked); missing ids are silently absent
pub async fn list_looks(pool: &SqlitePool, look_ids: &[Uuid]) -> Result<Vec<Look>> {
    let mut looks = Vec::new();

    for chunk in look_ids.chunks(FILTER_CHUNK) {
        let sql = format!(
            "SELECT * FROM looks WHERE look_id IN ({})",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id.to_string());
        }
        for row in &query.fetch_all(pool).await? {
            looks.push(look_from_row(row)?);
        }
    }

    Ok(looks)
}

/// Load all Views for a Look id set, grouped by Look
pub async fn views_for_looks(
    pool: &SqlitePool,
    look_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<View>>> {
    let mut by_look: HashMap<Uuid, Vec<View>> = HashMap::new();

    for chunk in look_ids.chunks(FILTER_CHUNK) {
        let sql = format!(
            "SELECT * FROM views WHERE look_id IN ({})",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id.to_string());
        }
        for row in &query.fetch_all(pool).await? {
            let view = view_from_row(row)?;
            by_look.entry(view.look_id).or_default().push(view);
        }
    }

    Ok(by_look)
}
