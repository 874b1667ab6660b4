//! In-memory stand-ins for the platform collaborators: the user directory and
//! the course catalog. The standalone binary seeds them from configuration;
//! tests populate them directly.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::policy::{CourseFacts, LessonFacts, ResourceFactSource};
use super::provider::{DirectoryUser, DisplayProfile, UserDirectory};

#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    by_email: RwLock<HashMap<String, DirectoryUser>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, user: DirectoryUser) {
        self.by_email.write().insert(user.email.to_lowercase(), user);
    }

    pub fn len(&self) -> usize { self.by_email.read().len() }

    pub fn is_empty(&self) -> bool { self.by_email.read().is_empty() }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<DirectoryUser>> {
        Ok(self.by_email.read().get(&email.trim().to_lowercase()).cloned())
    }

    async fn display_profile(&self, principal_id: &str) -> Result<Option<DisplayProfile>> {
        Ok(self
            .by_email
            .read()
            .values()
            .find(|u| u.principal_id == principal_id)
            .map(|u| DisplayProfile {
                principal_id: u.principal_id.clone(),
                email: u.email.clone(),
                display_name: u.display_name.clone(),
            }))
    }
}

#[derive(Debug, Default)]
pub struct MemoryCourseCatalog {
    courses: RwLock<HashMap<String, CourseFacts>>,
    lessons: RwLock<HashMap<String, LessonFacts>>,
    enrollments: RwLock<HashSet<(String, String)>>,
    payments: RwLock<HashSet<(String, String)>>,
}

impl MemoryCourseCatalog {
    pub fn new() -> Self { Self::default() }

    pub fn put_course(&self, course_id: &str, published: bool, price_cents: u64, owner: Option<&str>) {
        self.courses.write().insert(
            course_id.to_string(),
            CourseFacts { exists: true, published, price_cents, owner_instructor_id: owner.map(str::to_string) },
        );
    }

    pub fn put_lesson(&self, lesson_id: &str, course_id: &str, published: bool) {
        self.lessons.write().insert(
            lesson_id.to_string(),
            LessonFacts { exists: true, published, course_id: course_id.to_string() },
        );
    }

    pub fn enroll(&self, student_id: &str, course_id: &str) {
        self.enrollments.write().insert((student_id.to_string(), course_id.to_string()));
    }

    pub fn record_payment(&self, student_id: &str, course_id: &str) {
        self.payments.write().insert((student_id.to_string(), course_id.to_string()));
    }
}

#[async_trait]
impl ResourceFactSource for MemoryCourseCatalog {
    async fn course_facts(&self, course_id: &str) -> Result<CourseFacts> {
        Ok(self.courses.read().get(course_id).cloned().unwrap_or_default())
    }

    async fn lesson_facts(&self, lesson_id: &str) -> Result<LessonFacts> {
        Ok(self.lessons.read().get(lesson_id).cloned().unwrap_or_default())
    }

    async fn has_enrollment(&self, student_id: &str, course_id: &str) -> Result<bool> {
        Ok(self.enrollments.read().contains(&(student_id.to_string(), course_id.to_string())))
    }

    async fn has_completed_payment(&self, student_id: &str, course_id: &str) -> Result<bool> {
        Ok(self.payments.read().contains(&(student_id.to_string(), course_id.to_string())))
    }
}
