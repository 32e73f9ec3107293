use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::model::{LectureProcessing, ProcessingStatus};

/// Longest error message stored on a lecture, in characters.
pub const MAX_ERROR_CHARS: usize = 500;

pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_CHARS) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

/// Processing fields of a lecture. Every write is a single-row update keyed
/// by lecture id; a missing lecture is an error.
///
/// `set_pending` assigns the lecture's current job. The other writes only
/// apply while `job_id` is still that job and return `false` once a newer
/// upload replaced it.
#[async_trait]
pub trait LectureGateway: Send + Sync {
    async fn exists(&self, lecture_id: Uuid) -> Result<bool>;

    async fn processing(&self, lecture_id: Uuid) -> Result<Option<LectureProcessing>>;

    async fn set_pending(&self, lecture_id: Uuid, job_id: Uuid) -> Result<()>;

    async fn set_processing(&self, lecture_id: Uuid, job_id: Uuid) -> Result<bool>;

    async fn set_completed(&self, lecture_id: Uuid, job_id: Uuid, video_link: &str) -> Result<bool>;

    async fn set_failed(&self, lecture_id: Uuid, job_id: Uuid, error: &str) -> Result<bool>;
}

#[derive(Clone)]
pub struct PgLectureGateway {
    pool: PgPool,
}

impl PgLectureGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn ensure_updated(lecture_id: Uuid, rows: u64) -> Result<()> {
        if rows == 0 {
            return Err(anyhow!("Lecture {} not found", lecture_id));
        }
        Ok(())
    }

    /// Zero rows on a job-scoped write: either the lecture is gone or it
    /// belongs to another job by now.
    async fn job_scoped(&self, lecture_id: Uuid, rows: u64) -> Result<bool> {
        if rows > 0 {
            return Ok(true);
        }
        if self.exists(lecture_id).await? {
            return Ok(false);
        }
        Err(anyhow!("Lecture {} not found", lecture_id))
    }
}

#[async_trait]
impl LectureGateway for PgLectureGateway {
    async fn exists(&self, lecture_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM lectures WHERE id = $1)")
            .bind(lecture_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn processing(&self, lecture_id: Uuid) -> Result<Option<LectureProcessing>> {
        let row = sqlx::query_as::<_, LectureProcessing>(
            r#"
            SELECT id, processing_status, job_id, video_link, processing_error, updated_at
            FROM lectures
            WHERE id = $1
            "#,
        )
        .bind(lecture_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_pending(&self, lecture_id: Uuid, job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE lectures
            SET processing_status = $2, job_id = $3, video_link = NULL, processing_error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(lecture_id)
        .bind(ProcessingStatus::Pending.as_str())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(lecture_id, result.rows_affected())
    }

    async fn set_processing(&self, lecture_id: Uuid, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE lectures
            SET processing_status = $2, processing_error = NULL, updated_at = NOW()
            WHERE id = $1 AND job_id = $3
            "#,
        )
        .bind(lecture_id)
        .bind(ProcessingStatus::Processing.as_str())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        self.job_scoped(lecture_id, result.rows_affected()).await
    }

    async fn set_completed(&self, lecture_id: Uuid, job_id: Uuid, video_link: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE lectures
            SET processing_status = $2, video_link = $3, processing_error = NULL, updated_at = NOW()
            WHERE id = $1 AND job_id = $4
            "#,
        )
        .bind(lecture_id)
        .bind(ProcessingStatus::Completed.as_str())
        .bind(video_link)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        self.job_scoped(lecture_id, result.rows_affected()).await
    }

    async fn set_failed(&self, lecture_id: Uuid, job_id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE lectures
            SET processing_status = $2, processing_error = $3, updated_at = NOW()
            WHERE id = $1 AND job_id = $4
            "#,
        )
        .bind(lecture_id)
        .bind(ProcessingStatus::Failed.as_str())
        .bind(truncate_error(error))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        self.job_scoped(lecture_id, result.rows_affected()).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_errors_are_kept_verbatim() {
        assert_eq!(truncate_error("encoder exited with code 1"), "encoder exited with code 1");
    }

    #[test]
    fn long_errors_are_cut_on_a_char_boundary() {
        let message = "é".repeat(MAX_ERROR_CHARS + 20);
        let truncated = truncate_error(&message);
        assert_eq!(truncated.chars().count(), MAX_ERROR_CHARS);
        assert!(message.starts_with(&truncated));
    }

    #[tokio::test]
    async fn writes_of_a_replaced_job_are_skipped() {
        let gateway = testing::MemoryLectureGateway::default();
        let lecture_id = Uuid::new_v4();
        let (old_job, new_job) = (Uuid::new_v4(), Uuid::new_v4());
        gateway.insert_with_job(lecture_id, old_job);

        gateway.set_pending(lecture_id, new_job).await.unwrap();
        assert!(gateway.set_completed(lecture_id, new_job, "https://cdn.test/b/master.m3u8").await.unwrap());

        assert!(!gateway.set_processing(lecture_id, old_job).await.unwrap());
        assert!(!gateway.set_failed(lecture_id, old_job, "input missing").await.unwrap());

        let row = gateway.row(lecture_id);
        assert_eq!(row.status(), Some(ProcessingStatus::Completed));
        assert_eq!(row.job_id, Some(new_job.to_string()));
        assert_eq!(row.video_link.as_deref(), Some("https://cdn.test/b/master.m3u8"));
        assert!(row.processing_error.is_none());

        assert!(gateway.set_failed(Uuid::new_v4(), old_job, "gone").await.is_err());
    }

    #[test]
    fn status_round_trips_through_text_column() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ProcessingStatus>().unwrap(), status);
        }
        assert!("READY".parse::<ProcessingStatus>().is_err());
    }
}
