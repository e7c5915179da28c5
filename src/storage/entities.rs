use sqlx::FromRow;
use time::OffsetDateTime;

#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub source_name: String,
    pub last_checked: OffsetDateTime,
}
