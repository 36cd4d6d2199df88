//! # Policy Resolution
//!
//! Selects the policies that apply to an event's subject and orders them.
//!
//! ## Conflict Ordering
//!
//! When several policies apply, they are returned in a total order:
//! 1. **Priority**, higher first.
//! 2. **Specificity**, user before group before global.
//! 3. **Policy ID**, ascending, as the deterministic tiebreaker.
//!
//! Every applicable policy is returned; none shadows another. Each is then
//! evaluated independently by the dispatcher.

use std::sync::Arc;

use warden_core::PolicyId;

use crate::error::ResolutionError;
use crate::event::{EventKind, Subject};
use crate::policy::{Policy, PolicyScope};

/// Read access to configured policies.
pub trait PolicyStore: Send + Sync {
    /// Every stored policy, active or not.
    fn snapshot(&self) -> Result<Vec<Arc<Policy>>, ResolutionError>;

    /// One policy by id.
    fn get(&self, id: &PolicyId) -> Result<Option<Arc<Policy>>, ResolutionError>;
}

/// Resolves applicable policies from a [`PolicyStore`].
#[derive(Clone)]
pub struct PolicyResolver {
    store: Arc<dyn PolicyStore>,
}

impl PolicyResolver {
    /// Create a resolver over `store`.
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// Applicable policies for `subject` and `kind`, in conflict order.
    pub fn resolve(
        &self,
        subject: &Subject,
        kind: EventKind,
    ) -> Result<Vec<Arc<Policy>>, ResolutionError> {
        let snapshot = self.store.snapshot()?;
        Ok(select(snapshot, subject, kind))
    }
}

impl std::fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyResolver").finish_non_exhaustive()
    }
}

/// Whether `policy` applies to `subject` for an event of `kind`.
pub fn applies_to(policy: &Policy, subject: &Subject, kind: EventKind) -> bool {
    if !policy.is_active {
        return false;
    }
    if policy.requires_manual_trigger && kind != EventKind::Manual {
        return false;
    }
    match &policy.scope {
        PolicyScope::Global => true,
        PolicyScope::Group { department } => department
            .trim()
            .eq_ignore_ascii_case(subject.department.trim()),
        PolicyScope::User { subject_id } => subject_id == &subject.subject_id,
    }
}

/// Filter and order a snapshot. Pure.
pub fn select(
    policies: impl IntoIterator<Item = Arc<Policy>>,
    subject: &Subject,
    kind: EventKind,
) -> Vec<Arc<Policy>> {
    let mut applicable: Vec<Arc<Policy>> = policies
        .into_iter()
        .filter(|p| applies_to(p, subject, kind))
        .collect();
    applicable.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.scope.specificity().cmp(&a.scope.specificity()))
            .then_with(|| a.id.cmp(&b.id))
    });
    applicable
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::SubjectId;

    fn subject() -> Subject {
        Subject {
            subject_id: SubjectId::new("emp-42").unwrap(),
            department: "Finance".into(),
        }
    }

    fn policy(id: &str, priority: i32, scope: PolicyScope) -> Arc<Policy> {
        Arc::new(Policy::new(PolicyId::new(id).unwrap(), id, scope).with_priority(priority))
    }

    fn ids(policies: &[Arc<Policy>]) -> Vec<&str> {
        policies.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn priority_beats_specificity() {
        let p1 = policy(
            "p1",
            80,
            PolicyScope::User {
                subject_id: SubjectId::new("emp-42").unwrap(),
            },
        );
        let p2 = policy("p2", 90, PolicyScope::Global);
        let resolved = select(vec![p1, p2], &subject(), EventKind::RiskUpdated);
        assert_eq!(ids(&resolved), vec!["p2", "p1"]);
    }

    #[test]
    fn specificity_then_id_break_ties() {
        let g = policy("a-global", 50, PolicyScope::Global);
        let grp = policy(
            "z-group",
            50,
            PolicyScope::Group {
                department: "finance ".into(),
            },
        );
        let user = policy(
            "m-user",
            50,
            PolicyScope::User {
                subject_id: SubjectId::new("emp-42").unwrap(),
            },
        );
        let g2 = policy("b-global", 50, PolicyScope::Global);
        let resolved = select(vec![g2, g, grp, user], &subject(), EventKind::RiskUpdated);
        assert_eq!(ids(&resolved), vec!["m-user", "z-group", "a-global", "b-global"]);
    }

    #[test]
    fn scope_filtering() {
        let other_dept = policy(
            "hr",
            10,
            PolicyScope::Group {
                department: "HR".into(),
            },
        );
        let other_user = policy(
            "u",
            10,
            PolicyScope::User {
                subject_id: SubjectId::new("emp-7").unwrap(),
            },
        );
        let inactive = Arc::new(
            Policy::new(PolicyId::new("off").unwrap(), "off", PolicyScope::Global)
                .with_active(false),
        );
        let resolved = select(
            vec![other_dept, other_user, inactive],
            &subject(),
            EventKind::RiskUpdated,
        );
        assert!(resolved.is_empty());
    }

    #[test]
    fn manual_policies_need_manual_events() {
        let manual = Arc::new(
            Policy::new(PolicyId::new("manual").unwrap(), "m", PolicyScope::Global).manual_only(),
        );
        assert!(select(vec![manual.clone()], &subject(), EventKind::ViolationCreated).is_empty());
        assert_eq!(select(vec![manual], &subject(), EventKind::Manual).len(), 1);
    }
}
