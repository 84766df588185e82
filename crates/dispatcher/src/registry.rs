use std::collections::HashMap;
use std::fmt;

use datasync_core::{
    JobKind, JobReference, ParameterValidator, RegistryConfig, SyncError, SyncResult,
};
use serde_json::Value;
use tracing::{debug, warn};

/// 作业注册表
///
/// 把 `(source_system, operation)` 解析成运行时可执行的作业引用。优先使用显式映射表；
/// 未登记的组合按 `sync_{source_system}_{operation}` 约定生成引用，并记录告警，
/// 以便运维把它们补进显式表。名称中只允许字母、数字、`_` 和 `-`。
///
/// 作业引用可以登记参数校验，提交时参数不合法直接拒绝准入。
#[derive(Clone, Default)]
pub struct JobRegistry {
    explicit: HashMap<JobKind, JobReference>,
    validators: HashMap<String, ParameterValidator>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut validated: Vec<&String> = self.validators.keys().collect();
        validated.sort();
        f.debug_struct("JobRegistry")
            .field("explicit", &self.explicit)
            .field("validated", &validated)
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RegistryConfig) -> SyncResult<Self> {
        let mut registry = Self::new();
        for entry in &config.jobs {
            registry.register(
                JobKind::new(&entry.source_system, &entry.operation),
                JobReference::new(&entry.job_ref),
            )?;
        }
        Ok(registry)
    }

    /// 登记显式映射，同一作业类型重复登记时以后者为准
    pub fn register(&mut self, kind: JobKind, job_ref: JobReference) -> SyncResult<()> {
        Self::validate_kind(&kind)?;
        Self::validate_name("job_ref", job_ref.as_str())?;
        if let Some(previous) = self.explicit.insert(kind.clone(), job_ref.clone()) {
            warn!("作业类型 {} 的映射被覆盖: {} -> {}", kind, previous, job_ref);
        }
        Ok(())
    }

    /// 解析作业引用，作业类型不合法时返回 `SyncError::Admission`
    pub fn resolve(&self, source_system: &str, operation: &str) -> SyncResult<JobReference> {
        let kind = JobKind::new(source_system, operation);
        Self::validate_kind(&kind)?;

        if let Some(job_ref) = self.explicit.get(&kind) {
            debug!("作业类型 {} 命中显式映射: {}", kind, job_ref);
            return Ok(job_ref.clone());
        }

        let job_ref = JobReference::new(format!(
            "sync_{}_{}",
            source_system.to_ascii_lowercase(),
            operation.to_ascii_lowercase()
        ));
        warn!(
            job.source = source_system,
            job.operation = operation,
            "作业类型 {} 未在注册表中登记，按命名约定解析为 {}",
            kind,
            job_ref
        );
        Ok(job_ref)
    }

    /// 为作业引用登记参数校验
    pub fn set_validator(&mut self, job_ref: impl Into<String>, validator: ParameterValidator) {
        self.validators.insert(job_ref.into(), validator);
    }

    /// 准入检查：解析作业引用并校验参数，任何不合法都返回 `SyncError::Admission`
    pub fn admit(&self, kind: &JobKind, parameters: &Value) -> SyncResult<JobReference> {
        let job_ref = self.resolve(&kind.source_system, &kind.operation)?;
        if !parameters.is_object() && !parameters.is_null() {
            return Err(SyncError::Admission("作业参数必须是JSON对象".to_string()));
        }
        if let Some(validate) = self.validators.get(job_ref.as_str()) {
            validate(parameters).map_err(|e| {
                SyncError::Admission(format!("作业 {kind} 的参数无效: {e}"))
            })?;
        }
        Ok(job_ref)
    }

    pub fn entries(&self) -> Vec<(JobKind, JobReference)> {
        let mut entries: Vec<_> = self
            .explicit
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn validate_kind(kind: &JobKind) -> SyncResult<()> {
        Self::validate_name("source_system", &kind.source_system)?;
        Self::validate_name("operation", &kind.operation)
    }

    fn validate_name(field: &str, value: &str) -> SyncResult<()> {
        if value.is_empty() {
            return Err(SyncError::Admission(format!("{field} 不能为空")));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SyncError::Admission(format!(
                "{field} 包含非法字符: {value}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_core::RegistryEntry;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_explicit_mapping_wins() {
        let config = RegistryConfig {
            jobs: vec![RegistryEntry {
                source_system: "crm".to_string(),
                operation: "contacts".to_string(),
                job_ref: "crm-contacts-v2".to_string(),
            }],
        };
        let registry = JobRegistry::from_config(&config).unwrap();
        assert_eq!(
            registry.resolve("crm", "contacts").unwrap().as_str(),
            "crm-contacts-v2"
        );
        assert_eq!(registry.entries().len(), 1);
    }

    #[test]
    fn test_convention_fallback() {
        let registry = JobRegistry::new();
        assert_eq!(
            registry.resolve("ERP", "Invoices").unwrap().as_str(),
            "sync_erp_invoices"
        );
    }

    #[test]
    fn test_invalid_kind_is_admission_error() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.resolve("", "contacts"),
            Err(SyncError::Admission(_))
        ));
        assert!(matches!(
            registry.resolve("crm", "contacts; drop"),
            Err(SyncError::Admission(_))
        ));
    }

    #[test]
    fn test_admit_runs_parameter_validator() {
        let mut registry = JobRegistry::new();
        registry.set_validator(
            "sync_crm_contacts",
            Arc::new(|parameters: &Value| match parameters.get("force_full") {
                Some(flag) if !flag.is_boolean() => {
                    Err(SyncError::Validation("force_full 必须是布尔值".to_string()))
                }
                _ => Ok(()),
            }),
        );
        let contacts = JobKind::new("crm", "contacts");

        assert!(registry.admit(&contacts, &json!({ "force_full": true })).is_ok());
        assert!(registry.admit(&contacts, &Value::Null).is_ok());
        assert!(matches!(
            registry.admit(&contacts, &json!({ "force_full": "yes" })),
            Err(SyncError::Admission(_))
        ));
        assert!(matches!(
            registry.admit(&contacts, &json!([1, 2])),
            Err(SyncError::Admission(_))
        ));
        // 其他作业引用不受影响
        assert!(registry
            .admit(&JobKind::new("erp", "invoices"), &json!({ "force_full": "yes" }))
            .is_ok());
    }

    #[test]
    fn test_invalid_config_entry_rejected() {
        let config = RegistryConfig {
            jobs: vec![RegistryEntry {
                source_system: "crm".to_string(),
                operation: "contacts".to_string(),
                job_ref: "bad ref".to_string(),
            }],
        };
        assert!(JobRegistry::from_config(&config).is_err());
    }
}
