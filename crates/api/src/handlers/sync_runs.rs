use axum::{
    extract::{Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use datasync_core::{SyncRunFilter, SyncRunStatus};
use serde::Deserialize;

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

/// 同步历史查询参数，`from`/`to` 作用于运行开始时间，区间左闭右开
#[derive(Debug, Default, Deserialize)]
pub struct SyncRunQueryParams {
    pub source_system: Option<String>,
    pub operation: Option<String>,
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl SyncRunQueryParams {
    fn into_filter(self) -> ApiResult<SyncRunFilter> {
        let status = self
            .status
            .as_deref()
            .map(SyncRunStatus::parse)
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(ApiError::BadRequest(format!(
                "limit 必须在 1 到 {MAX_LIMIT} 之间"
            )));
        }

        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from >= to {
                return Err(ApiError::BadRequest("from 必须早于 to".to_string()));
            }
        }

        Ok(SyncRunFilter {
            source_system: self.source_system,
            operation: self.operation,
            status,
            started_after: self.from,
            started_before: self.to,
            limit: Some(limit),
        })
    }
}

/// 查询同步运行历史，按开始时间倒序
pub async fn list_sync_runs(
    State(state): State<AppState>,
    Query(params): Query<SyncRunQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = params.into_filter()?;
    let runs = state.sync_runs.query(&filter).await?;
    Ok(success(runs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_to_filter() {
        let filter = SyncRunQueryParams {
            source_system: Some("crm".into()),
            status: Some("partial".into()),
            ..Default::default()
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.status, Some(SyncRunStatus::Partial));
        assert_eq!(filter.limit, Some(DEFAULT_LIMIT));
        assert_eq!(filter.source_system.as_deref(), Some("crm"));
    }

    #[test]
    fn test_invalid_query_params() {
        let bad_status = SyncRunQueryParams {
            status: Some("done".into()),
            ..Default::default()
        };
        assert!(bad_status.into_filter().is_err());

        let bad_limit = SyncRunQueryParams {
            limit: Some(0),
            ..Default::default()
        };
        assert!(bad_limit.into_filter().is_err());

        let now = Utc::now();
        let bad_range = SyncRunQueryParams {
            from: Some(now),
            to: Some(now),
            ..Default::default()
        };
        assert!(bad_range.into_filter().is_err());
    }
}
