//! Business-rule gates evaluated by the controller before a job is created.
//!
//! Policies see the template, the merged params and the current time; a
//! rejection is returned to the caller as `AdmissionRejected` and nothing is
//! written or queued. `check` is side-effect free: a policy that keeps
//! bookkeeping updates it in `record`, which the controller calls only once
//! the job is persisted and queued.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use serde::Deserialize;

use crate::state_machine::Params;
use crate::template::Template;

/// One job asking to be admitted.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub template: &'a Template,
    pub params: &'a Params,
    pub now: DateTime<Utc>,
    /// Jobs ahead of this one in the same batch that have passed but are
    /// not recorded yet.
    pub pending: usize,
}

impl<'a> AdmissionRequest<'a> {
    pub fn new(template: &'a Template, params: &'a Params, now: DateTime<Utc>) -> Self {
        Self {
            template,
            params,
            now,
            pending: 0,
        }
    }

    pub fn with_pending(mut self, pending: usize) -> Self {
        self.pending = pending;
        self
    }
}

pub trait AdmissionPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(reason)` rejects the job.
    fn check(&self, request: &AdmissionRequest<'_>) -> Result<(), String>;

    /// Called once the job has been persisted and queued.
    fn record(&self, _template: &Template, _now: DateTime<Utc>) {}
}

/// Pauses the listed templates on Saturdays and Sundays (UTC). An empty
/// list pauses every template.
#[derive(Debug, Clone)]
pub struct WeekendPause {
    templates: Vec<String>,
}

impl WeekendPause {
    pub fn new(templates: Vec<String>) -> Self {
        Self { templates }
    }

    fn applies_to(&self, template_id: &str) -> bool {
        self.templates.is_empty() || self.templates.iter().any(|t| t == template_id)
    }
}

impl AdmissionPolicy for WeekendPause {
    fn name(&self) -> &str {
        "weekend_pause"
    }

    fn check(&self, request: &AdmissionRequest<'_>) -> Result<(), String> {
        let template = request.template;
        let weekend = matches!(request.now.weekday(), Weekday::Sat | Weekday::Sun);
        if weekend && self.applies_to(&template.id) {
            return Err(format!("template `{}` is paused on weekends", template.id));
        }
        Ok(())
    }
}

/// Admits at most `max_jobs` per sliding window, counted per template or
/// globally.
#[derive(Debug)]
pub struct RateLimit {
    max_jobs: usize,
    window: Duration,
    per_template: bool,
    admitted: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimit {
    pub fn new(max_jobs: usize, window: Duration, per_template: bool) -> Self {
        Self {
            max_jobs,
            window,
            per_template,
            admitted: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimit {
    fn key(&self, template: &Template) -> String {
        if self.per_template {
            template.id.clone()
        } else {
            String::new()
        }
    }

    fn window_of<'m>(
        &self,
        admitted: &'m mut HashMap<String, VecDeque<DateTime<Utc>>>,
        template: &Template,
        now: DateTime<Utc>,
    ) -> &'m mut VecDeque<DateTime<Utc>> {
        let times = admitted.entry(self.key(template)).or_default();
        while times.front().is_some_and(|t| now - *t >= self.window) {
            times.pop_front();
        }
        times
    }
}

impl AdmissionPolicy for RateLimit {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn check(&self, request: &AdmissionRequest<'_>) -> Result<(), String> {
        let mut admitted = self
            .admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let times = self.window_of(&mut admitted, request.template, request.now);
        if times.len() + request.pending >= self.max_jobs {
            return Err(format!(
                "rate limit of {} jobs per {}s reached",
                self.max_jobs,
                self.window.num_seconds()
            ));
        }
        Ok(())
    }

    fn record(&self, template: &Template, now: DateTime<Utc>) {
        let mut admitted = self
            .admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.window_of(&mut admitted, template, now).push_back(now);
    }
}

/// `[admission]` section of the engine config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdmissionConfig {
    /// Templates paused on weekends. Absent disables the gate.
    #[serde(default)]
    pub weekend_pause: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub max_jobs: usize,
    pub window_secs: u64,
    #[serde(default)]
    pub per_template: bool,
}

impl AdmissionConfig {
    pub fn build(&self) -> Vec<Box<dyn AdmissionPolicy>> {
        let mut policies: Vec<Box<dyn AdmissionPolicy>> = Vec::new();
        if let Some(templates) = &self.weekend_pause {
            policies.push(Box::new(WeekendPause::new(templates.clone())));
        }
        if let Some(limit) = &self.rate_limit {
            policies.push(Box::new(RateLimit::new(
                limit.max_jobs,
                Duration::seconds(limit.window_secs as i64),
                limit.per_template,
            )));
        }
        policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateRegistry;
    use chrono::TimeZone;
    use std::sync::Arc;

    const TEMPLATES: &str = r#"
        [[template]]
        id = "scrape"
        name = "Scrape"
        [[template.steps]]
        id = "s"
        name = "S"
        service = "x"
        timeout_ms = 10

        [[template]]
        id = "report"
        name = "Report"
        [[template.steps]]
        id = "r"
        name = "R"
        service = "x"
        timeout_ms = 10
    "#;

    fn templates() -> (Arc<Template>, Arc<Template>) {
        let registry = TemplateRegistry::from_toml_str(TEMPLATES).unwrap();
        (registry.get("scrape").unwrap(), registry.get("report").unwrap())
    }

    fn admit(policy: &dyn AdmissionPolicy, template: &Template, now: DateTime<Utc>) -> Result<(), String> {
        let params = Params::new();
        policy.check(&AdmissionRequest::new(template, &params, now))?;
        policy.record(template, now);
        Ok(())
    }

    #[test]
    fn weekend_pause_only_blocks_listed_templates_on_weekends() {
        let (scrape, report) = templates();
        let policy = WeekendPause::new(vec!["scrape".into()]);
        let saturday = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();

        assert!(admit(&policy, &scrape, saturday).is_err());
        assert!(admit(&policy, &report, saturday).is_ok());
        assert!(admit(&policy, &scrape, monday).is_ok());
    }

    #[test]
    fn empty_weekend_pause_applies_to_all() {
        let (_, report) = templates();
        let sunday = Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap();
        assert!(admit(&WeekendPause::new(Vec::new()), &report, sunday).is_err());
    }

    #[test]
    fn rate_limit_slides() {
        let (scrape, _) = templates();
        let policy = RateLimit::new(2, Duration::seconds(60), false);
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();

        assert!(admit(&policy, &scrape, t0).is_ok());
        assert!(admit(&policy, &scrape, t0 + Duration::seconds(10)).is_ok());
        let err = admit(&policy, &scrape, t0 + Duration::seconds(20)).unwrap_err();
        assert!(err.contains("2 jobs per 60s"));
        assert!(admit(&policy, &scrape, t0 + Duration::seconds(61)).is_ok());
    }

    #[test]
    fn rate_limit_check_alone_takes_no_slot() {
        let (scrape, _) = templates();
        let policy = RateLimit::new(1, Duration::seconds(60), false);
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let params = Params::new();
        let request = AdmissionRequest::new(&scrape, &params, now);

        for _ in 0..3 {
            assert!(policy.check(&request).is_ok());
        }
        // The second job of a batch sees the first one as pending.
        assert!(policy.check(&request.with_pending(1)).is_err());

        policy.record(&scrape, now);
        assert!(policy.check(&request).is_err());
    }

    #[test]
    fn per_template_rate_limit_counts_separately() {
        let (scrape, report) = templates();
        let policy = RateLimit::new(1, Duration::seconds(60), true);
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();

        assert!(admit(&policy, &scrape, now).is_ok());
        assert!(admit(&policy, &report, now).is_ok());
        assert!(admit(&policy, &scrape, now).is_err());
    }

    #[test]
    fn config_builds_policies() {
        let config: AdmissionConfig = toml::from_str(
            r#"
            weekend_pause = ["scrape"]
            [rate_limit]
            max_jobs = 5
            window_secs = 60
            "#,
        )
        .unwrap();
        let names: Vec<String> = config.build().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["weekend_pause", "rate_limit"]);
        assert!(AdmissionConfig::default().build().is_empty());
    }
}
