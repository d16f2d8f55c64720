use super::schema::Database;
use super::types::{DatabaseError, NewSummary, Summary, SummaryRow};

impl Database {
    /// Store a generated summary and return it with its id.
    pub async fn insert_summary(&self, summary: &NewSummary) -> Result<Summary, DatabaseError> {
        let content_ids = serde_json::to_string(&summary.content_ids)
            .map_err(|e| DatabaseError::Validation(e.to_string()))?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO summaries (content_ids, prompt, summary_text, model_used, tokens_used, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(&content_ids)
        .bind(&summary.prompt)
        .bind(&summary.summary_text)
        .bind(&summary.model_used)
        .bind(summary.tokens_used)
        .bind(summary.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Summary {
            id,
            content_ids: summary.content_ids.clone(),
            prompt: summary.prompt.clone(),
            summary_text: summary.summary_text.clone(),
            model_used: summary.model_used.clone(),
            tokens_used: summary.tokens_used,
            created_at: summary.created_at,
        })
    }

    /// Most recent summaries first.
    pub async fn recent_summaries(&self, limit: i64) -> Result<Vec<Summary>, DatabaseError> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            "SELECT id, content_ids, prompt, summary_text, model_used, tokens_used, created_at
             FROM summaries ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SummaryRow::into_summary).collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, NewSummary};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_insert_and_list_summaries() {
        let db = Database::open(":memory:").await.unwrap();

        let first = db
            .insert_summary(&NewSummary {
                content_ids: vec![3, 1],
                prompt: "What changed in creator monetization?".into(),
                summary_text: "Two trends stand out.".into(),
                model_used: "gpt-3.5-turbo".into(),
                tokens_used: Some(412),
                created_at: 1_700_000_000,
            })
            .await
            .unwrap();
        db.insert_summary(&NewSummary {
            content_ids: vec![2],
            prompt: "Summarize".into(),
            summary_text: "One item.".into(),
            model_used: "gpt-3.5-turbo".into(),
            tokens_used: None,
            created_at: 1_700_000_100,
        })
        .await
        .unwrap();

        let recent = db.recent_summaries(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content_ids, vec![2]);
        assert_eq!(recent[1], first);
    }
}
