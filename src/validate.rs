//! Request validation, run before any control-plane call.
//!
//! Checks are ordered (name, memory, vcpus, disk, data disks, image source)
//! and the first failure wins, so the reported field is deterministic.

use std::collections::HashSet;
use std::path::Path;

use crate::config::LimitsConfig;
use crate::error::ValidationError;
use crate::model::ProvisionRequest;

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct RequestValidator {
    limits: LimitsConfig,
}

impl RequestValidator {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    /// Validate `request` against the configured bounds. `existing` holds
    /// names already owned by other records.
    pub fn validate(
        &self,
        request: &ProvisionRequest,
        existing: &HashSet<String>,
    ) -> Result<(), ValidationError> {
        validate_name(&request.name)?;
        if existing.contains(&request.name) {
            return Err(ValidationError::new(
                "name",
                format!("'{}' is already reserved", request.name),
            ));
        }

        let limits = &self.limits;
        check_range(
            "memoryMiB",
            request.memory_mib,
            limits.min_memory_mib,
            limits.max_memory_mib,
        )?;
        check_range(
            "vcpuCount",
            u64::from(request.vcpu_count),
            u64::from(limits.min_vcpus),
            u64::from(limits.max_vcpus),
        )?;
        check_range("diskSizeGiB", request.disk_size_gib, 1, limits.max_disk_gib)?;

        if request.data_disks_gib.len() > limits.max_data_disks as usize {
            return Err(ValidationError::new(
                "dataDisksGiB",
                format!("at most {} data disks are allowed", limits.max_data_disks),
            ));
        }
        for size in &request.data_disks_gib {
            check_range("dataDisksGiB", *size, 1, limits.max_disk_gib)?;
        }

        if let Some(source) = &request.image_source_path {
            validate_source(source)?;
        }

        Ok(())
    }
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::new(field, "must be positive"));
    }
    if value < min || value > max {
        return Err(ValidationError::new(
            field,
            format!("must be between {min} and {max} (got {value})"),
        ));
    }
    Ok(())
}

/// Names become libvirt domain names and image directory names, so they are
/// restricted to `[a-zA-Z0-9][a-zA-Z0-9._-]*`.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::new(
            "name",
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    let valid = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(ValidationError::new(
            "name",
            format!("must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        ));
    }
    Ok(())
}

fn validate_source(path: &Path) -> Result<(), ValidationError> {
    let field = "imageSourcePath";
    let meta = std::fs::metadata(path).map_err(|e| {
        ValidationError::new(field, format!("{} is not accessible: {e}", path.display()))
    })?;
    if !meta.is_file() {
        return Err(ValidationError::new(
            field,
            format!("{} is not a regular file", path.display()),
        ));
    }
    std::fs::File::open(path).map_err(|e| {
        ValidationError::new(field, format!("{} is not readable: {e}", path.display()))
    })?;
    Ok(())
}
