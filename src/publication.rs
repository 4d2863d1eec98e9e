//! Published artifacts: secret-gated public snapshots of reports, plus the
//! directed link graph used for cross-navigation between them.

use crate::db::Database;
use crate::errors::{CoreError, CoreResult};
use crate::models::{PublishedReport, PublishedReportLink};
use crate::secrets::{self, SecretIssuer};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::sync::Arc;

static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"));

const SLUG_SUFFIX_LENGTH: usize = 6;
const SLUG_RETRY_LIMIT: usize = 5;
const MAX_SLUG_STEM: usize = 48;

/// Rejection message for every anonymous-access failure. Whether the slug is
/// unknown, the secret wrong, or the artifact disabled must be
/// indistinguishable to the caller.
const ACCESS_DENIED: &str = "invalid link or access code";

#[derive(Clone)]
pub struct PublicationRegistry {
    db: Arc<Database>,
    secrets: SecretIssuer,
}

impl PublicationRegistry {
    pub fn new(db: Arc<Database>) -> CoreResult<Self> {
        let settings = db.get_settings()?;
        Ok(Self {
            db,
            secrets: SecretIssuer::new(settings.secret_length),
        })
    }

    /// Publishes a report as a linkable artifact. Title and description fall
    /// back to the report's own; the report's title at publish time is
    /// frozen onto the artifact either way.
    pub fn publish(
        &self,
        report_id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> CoreResult<PublishedReport> {
        let report = self
            .db
            .get_report(report_id)?
            .ok_or_else(|| CoreError::NotFound(format!("report {} not found", report_id)))?;

        let title = match title.map(str::trim) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => report.title.clone(),
        };
        let description = match description.map(str::trim) {
            Some(value) if !value.is_empty() => Some(value.to_string()),
            _ if !report.description.trim().is_empty() => Some(report.description.clone()),
            _ => None,
        };
        let password = self.secrets.issue();

        let mut last_conflict = None;
        for _ in 0..SLUG_RETRY_LIMIT {
            let slug = new_slug(&title);
            match self.db.insert_published_report(
                report_id,
                &slug,
                &title,
                description.as_deref(),
                &report.title,
                &password,
            ) {
                Ok(published) => {
                    tracing::info!(pub_id = %published.id, slug = %published.slug, "published report");
                    return Ok(published);
                }
                Err(CoreError::Conflict(message)) => {
                    last_conflict = Some(message);
                    continue;
                }
                Err(error) => return Err(error),
            }
        }
        Err(CoreError::Conflict(last_conflict.unwrap_or_else(|| {
            "could not allocate a unique slug".to_string()
        })))
    }

    /// Replaces the artifact's secret. The previous secret stops verifying
    /// immediately; the new one is returned for one-time display.
    pub fn rotate_password(&self, pub_id: &str) -> CoreResult<String> {
        let password = self.secrets.issue();
        if !self.db.set_published_password(pub_id, &password)? {
            return Err(CoreError::NotFound(format!(
                "published report {} not found",
                pub_id
            )));
        }
        tracing::info!(pub_id = %pub_id, "rotated published report password");
        Ok(password)
    }

    pub fn get(&self, pub_id: &str) -> CoreResult<Option<PublishedReport>> {
        self.db.get_published_report(pub_id)
    }

    pub fn list(&self, page: u32, per_page: u32) -> CoreResult<Vec<PublishedReport>> {
        self.db.list_published_reports(page, per_page)
    }

    pub fn set_active(&self, pub_id: &str, is_active: bool) -> CoreResult<()> {
        if !self.db.set_published_active(pub_id, is_active)? {
            return Err(CoreError::NotFound(format!(
                "published report {} not found",
                pub_id
            )));
        }
        Ok(())
    }

    pub fn delete(&self, pub_id: &str) -> CoreResult<()> {
        if !self.db.delete_published_report(pub_id)? {
            return Err(CoreError::NotFound(format!(
                "published report {} not found",
                pub_id
            )));
        }
        Ok(())
    }

    pub fn add_link(
        &self,
        pub_id: &str,
        target_pub_id: &str,
        label: Option<&str>,
    ) -> CoreResult<PublishedReportLink> {
        if pub_id == target_pub_id {
            return Err(CoreError::Validation(
                "a published report cannot link to itself".to_string(),
            ));
        }
        if self.db.get_published_report(pub_id)?.is_none() {
            return Err(CoreError::NotFound(format!(
                "published report {} not found",
                pub_id
            )));
        }
        if self.db.get_published_report(target_pub_id)?.is_none() {
            return Err(CoreError::NotFound(format!(
                "published report {} not found",
                target_pub_id
            )));
        }
        self.db.insert_link(pub_id, target_pub_id, label)
    }

    pub fn remove_link(&self, pub_id: &str, link_id: &str) -> CoreResult<()> {
        if !self.db.delete_link(pub_id, link_id)? {
            return Err(CoreError::NotFound(format!("link {} not found", link_id)));
        }
        Ok(())
    }

    pub fn list_links(&self, pub_id: &str) -> CoreResult<Vec<PublishedReportLink>> {
        self.db.list_links(pub_id)
    }

    /// The sole read path for anonymous consumers. Fails closed on disabled
    /// artifacts and rejects uniformly.
    pub fn verify_access(&self, slug: &str, secret: &str) -> CoreResult<PublishedReport> {
        let denied = || CoreError::Auth(ACCESS_DENIED.to_string());

        let published = self.db.get_published_report_by_slug(slug)?.ok_or_else(denied)?;
        if !published.is_active {
            return Err(denied());
        }
        if !secrets::verify(&published.password, secret) {
            return Err(denied());
        }
        Ok(published)
    }
}

/// Slug stem from the title plus a short random suffix; collisions are
/// handled by the caller's retry loop.
fn new_slug(title: &str) -> String {
    let stem = NON_SLUG
        .replace_all(&title.to_lowercase(), "-")
        .trim_matches('-')
        .chars()
        .take(MAX_SLUG_STEM)
        .collect::<String>();
    let stem = stem.trim_end_matches('-');

    let mut rng = rand::rng();
    let suffix: String = (0..SLUG_SUFFIX_LENGTH)
        .map(|_| {
            const SLUG_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
            SLUG_CHARS[rng.random_range(0..SLUG_CHARS.len())] as char
        })
        .collect();

    if stem.is_empty() {
        format!("report-{}", suffix)
    } else {
        format!("{}-{}", stem, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::new_slug;

    #[test]
    fn slugs_are_url_safe_and_title_derived() {
        let slug = new_slug("Sales Q1 (EMEA & APAC)!");
        assert!(slug.starts_with("sales-q1-emea-apac-"));
        assert!(slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn empty_titles_still_produce_a_slug() {
        let slug = new_slug("!!!");
        assert!(slug.starts_with("report-"));
        assert!(slug.len() > "report-".len());
    }

    #[test]
    fn consecutive_slugs_differ() {
        assert_ne!(new_slug("Sales"), new_slug("Sales"));
    }
}
