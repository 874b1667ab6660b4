//! Dynamic resource-access policy for courses and lessons.
//!
//! Evaluation order is fixed: existence, publication, ownership/role,
//! enrollment, payment. Missing and unpublished resources both come back as
//! `NotFound` so callers cannot probe for unpublished content. Every fact is
//! fetched fresh from the collaborator under a timeout; lookup errors deny
//! access (`StorageUnavailable`), timeouts deny with the retryable
//! `LookupTimeout`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{ForbiddenReason, GateError, GateResult};

use super::principal::{Principal, Role};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseFacts {
    pub exists: bool,
    pub published: bool,
    /// Price in minor currency units; zero means free.
    pub price_cents: u64,
    pub owner_instructor_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonFacts {
    pub exists: bool,
    pub published: bool,
    pub course_id: String,
}

/// Read-only view of the course platform the gate consults on every check.
#[async_trait]
pub trait ResourceFactSource: Send + Sync {
    async fn course_facts(&self, course_id: &str) -> anyhow::Result<CourseFacts>;
    async fn lesson_facts(&self, lesson_id: &str) -> anyhow::Result<LessonFacts>;
    async fn has_enrollment(&self, student_id: &str, course_id: &str) -> anyhow::Result<bool>;
    async fn has_completed_payment(&self, student_id: &str, course_id: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResourceRef {
    Course(String),
    Lesson(String),
}

impl ResourceRef {
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceRef::Course(_) => "course",
            ResourceRef::Lesson(_) => "lesson",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ResourceRef::Course(id) | ResourceRef::Lesson(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    NotFound,
    Forbidden(ForbiddenReason),
    PaymentRequired,
}

impl AccessDecision {
    pub fn into_result(self) -> GateResult<()> {
        match self {
            AccessDecision::Allow => Ok(()),
            AccessDecision::NotFound => Err(GateError::NotFound),
            AccessDecision::Forbidden(r) => Err(GateError::Forbidden(r)),
            AccessDecision::PaymentRequired => Err(GateError::PaymentRequired),
        }
    }
}

pub struct ResourcePolicy {
    facts: Arc<dyn ResourceFactSource>,
    timeout: Duration,
}

impl ResourcePolicy {
    pub fn new(facts: Arc<dyn ResourceFactSource>, timeout: Duration) -> Self { Self { facts, timeout } }

    pub async fn check(&self, principal: &Principal, resource: &ResourceRef) -> GateResult<()> {
        self.evaluate(principal, resource).await?.into_result()
    }

    pub async fn evaluate(&self, principal: &Principal, resource: &ResourceRef) -> GateResult<AccessDecision> {
        let decision = self.decide(principal, resource).await?;
        debug!(
            target: "coursegate::gate",
            principal = %principal.principal_id,
            kind = resource.kind(),
            id = resource.id(),
            decision = ?decision,
            "resource access evaluated"
        );
        Ok(decision)
    }

    async fn decide(&self, principal: &Principal, resource: &ResourceRef) -> GateResult<AccessDecision> {
        // existence
        let (course_id, lesson_published) = match resource {
            ResourceRef::Course(id) => (id.clone(), true),
            ResourceRef::Lesson(id) => {
                let lesson = self.bounded("lesson_facts", self.facts.lesson_facts(id)).await?;
                if !lesson.exists {
                    return Ok(AccessDecision::NotFound);
                }
                (lesson.course_id, lesson.published)
            }
        };
        let course = self.bounded("course_facts", self.facts.course_facts(&course_id)).await?;
        if !course.exists {
            return Ok(AccessDecision::NotFound);
        }

        let is_owner = course.owner_instructor_id.as_deref() == Some(principal.principal_id.as_str());
        let is_admin = principal.is_admin();

        // publication; owners and admins still see drafts
        if !(course.published && lesson_published) && !(is_owner || is_admin) {
            return Ok(AccessDecision::NotFound);
        }

        // ownership / role
        if is_owner || is_admin {
            return Ok(AccessDecision::Allow);
        }
        if principal.role != Role::Student {
            return Ok(AccessDecision::Forbidden(ForbiddenReason::NotOwner));
        }

        // enrollment
        let enrolled = self
            .bounded("has_enrollment", self.facts.has_enrollment(&principal.principal_id, &course_id))
            .await?;
        if !enrolled {
            return Ok(AccessDecision::Forbidden(ForbiddenReason::NotEnrolled));
        }

        // payment
        if course.price_cents > 0 {
            let paid = self
                .bounded("has_completed_payment", self.facts.has_completed_payment(&principal.principal_id, &course_id))
                .await?;
            if !paid {
                return Ok(AccessDecision::PaymentRequired);
            }
        }
        Ok(AccessDecision::Allow)
    }

    async fn bounded<T, F>(&self, what: &'static str, fut: F) -> GateResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                error!(target: "coursegate::gate", lookup = what, "resource fact lookup failed: {:#}", e);
                Err(GateError::storage(e))
            }
            Err(_) => {
                error!(target: "coursegate::gate", lookup = what, timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX), "resource fact lookup timed out");
                Err(GateError::LookupTimeout)
            }
        }
    }
}
