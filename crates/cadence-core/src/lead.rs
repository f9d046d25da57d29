//! Leads and their normalization.
//!
//! The normalized email (trimmed, lower-cased) is the identity of a lead inside
//! a run's pool. Incoming records from the sourcing pipeline use a mix of
//! snake_case and camelCase field names, so [`LeadRecord`] accepts both.

use serde::{Deserialize, Serialize};

/// A contact targeted by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    /// External enrichment run that produced this lead.
    #[serde(default)]
    pub source_run_id: Option<String>,
}

impl Lead {
    /// Minimal lead with just an address. Returns `None` for implausible emails.
    pub fn from_email(email: &str) -> Option<Self> {
        let email = normalize_email(email)?;
        let domain = domain_of(&email);
        Some(Self {
            email,
            name: None,
            company: None,
            title: None,
            domain,
            source_url: None,
            source_run_id: None,
        })
    }

    /// Last-write-wins merge of attribute fields from a newer record.
    /// Fields absent in `newer` keep their current value.
    pub fn merge_from(&mut self, newer: &Lead) -> bool {
        let mut changed = false;
        for (slot, value) in [
            (&mut self.name, &newer.name),
            (&mut self.company, &newer.company),
            (&mut self.title, &newer.title),
            (&mut self.domain, &newer.domain),
            (&mut self.source_url, &newer.source_url),
            (&mut self.source_run_id, &newer.source_run_id),
        ] {
            if value.is_some() && slot != value {
                *slot = value.clone();
                changed = true;
            }
        }
        changed
    }
}

/// Lower-case and trim an address; `None` when it cannot be an email.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty()
        || domain.len() < 3
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || domain.contains('@')
        || email.chars().any(char::is_whitespace)
    {
        return None;
    }
    Some(email)
}

fn domain_of(email: &str) -> Option<String> {
    email.split_once('@').map(|(_, d)| d.to_string())
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Wire shape of a lead from the enrichment pipeline or a catalog file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadRecord {
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "fullName", alias = "full_name")]
    pub name: Option<String>,
    #[serde(default, alias = "companyName", alias = "company_name", alias = "organization")]
    pub company: Option<String>,
    #[serde(default, alias = "jobTitle", alias = "job_title")]
    pub title: Option<String>,
    #[serde(default, alias = "companyDomain", alias = "company_domain")]
    pub domain: Option<String>,
    #[serde(default, alias = "sourceUrl", alias = "url", alias = "linkedinUrl")]
    pub source_url: Option<String>,
}

impl LeadRecord {
    /// Normalize into a [`Lead`]; `None` when the email is not usable.
    pub fn normalize(self, source_run_id: Option<&str>) -> Option<Lead> {
        let email = normalize_email(&self.email)?;
        let domain = clean(self.domain)
            .map(|d| d.to_lowercase())
            .or_else(|| domain_of(&email));
        Some(Lead {
            email,
            name: clean(self.name),
            company: clean(self.company),
            title: clean(self.title),
            domain,
            source_url: clean(self.source_url),
            source_run_id: source_run_id.map(String::from),
        })
    }
}
