use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hs_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

impl QueryFilter {
    pub fn months(from_month: u32, to_month: u32) -> Self {
        Self {
            from_month: Some(from_month),
            to_month: Some(to_month),
            ..Self::default()
        }
    }

    pub fn with_hs_code(mut self, hs_code: impl Into<String>) -> Self {
        self.hs_code = Some(hs_code.into());
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn date_range(&self) -> (Option<u32>, Option<u32>) {
        (self.from_month, self.to_month)
    }

    pub fn normalized(&self) -> Self {
        Self {
            from_month: self.from_month,
            to_month: self.to_month,
            hs_code: clean(&self.hs_code),
            company: clean(&self.company),
            port: clean(&self.port),
            country: clean(&self.country),
            product: clean(&self.product),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(from) = self.from_month {
            check_month("from_month", from)?;
        }
        if let Some(to) = self.to_month {
            check_month("to_month", to)?;
        }
        if let (Some(from), Some(to)) = (self.from_month, self.to_month) {
            if from > to {
                return Err(JobError::Validation(format!(
                    "start month {from} is after end month {to}"
                )));
            }
        }
        if let Some(hs_code) = clean(&self.hs_code) {
            if !hs_code.chars().all(|c| c.is_ascii_digit() || c == '.') {
                return Err(JobError::Validation(format!(
                    "HS code '{hs_code}' may only contain digits"
                )));
            }
        }
        Ok(())
    }
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn parse_month(value: u32) -> Option<(i32, u32)> {
    let year = (value / 100) as i32;
    let month = value % 100;
    if !(1900..=9999).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, 1).map(|_| (year, month))
}

fn check_month(field: &str, value: u32) -> Result<()> {
    parse_month(value).map(|_| ()).ok_or_else(|| {
        JobError::Validation(format!("{field} must be a YYYYMM month, got {value}"))
    })
}
