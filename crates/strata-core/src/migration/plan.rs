//! Pending-set resolution.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::definition::Migration;

/// A migration that cannot run because some dependency is not satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedMigration {
    /// Version of the blocked migration.
    pub version: String,
    /// Dependencies that are neither applied nor earlier in the batch.
    pub unmet: Vec<String>,
}

/// Result of resolving what `migrate` would do.
#[derive(Debug, Clone, Default)]
pub struct PendingPlan {
    /// Migrations to apply, in order.
    pub pending: Vec<Migration>,
    /// Migrations held back by unmet dependencies. Never applied.
    pub blocked: Vec<BlockedMigration>,
}

impl PendingPlan {
    /// Versions of the pending migrations, in order.
    pub fn versions(&self) -> Vec<&str> {
        self.pending.iter().map(Migration::version).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Compute the ordered pending set.
///
/// Versions are visited in ascending order. An unapplied version is included
/// only when each dependency is already applied or was included earlier in
/// this same pass. Version order alone never satisfies a dependency.
pub(crate) fn resolve(
    definitions: &BTreeMap<String, Migration>,
    applied: &BTreeSet<String>,
    target: Option<&str>,
) -> PendingPlan {
    let mut plan = PendingPlan::default();
    let mut included: BTreeSet<&str> = BTreeSet::new();

    for (version, migration) in definitions {
        if applied.contains(version) {
            continue;
        }
        if let Some(target) = target {
            if version.as_str() > target {
                break;
            }
        }

        let unmet: Vec<String> = migration
            .dependencies()
            .iter()
            .filter(|dep| !applied.contains(*dep) && !included.contains(dep.as_str()))
            .cloned()
            .collect();

        if unmet.is_empty() {
            included.insert(version.as_str());
            plan.pending.push(migration.clone());
        } else {
            plan.blocked.push(BlockedMigration {
                version: version.clone(),
                unmet,
            });
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::SqlMigration;

    fn migration(version: &str, deps: &[&str]) -> Migration {
        Migration::new(version, format!("migration {}", version), SqlMigration::default())
            .unwrap()
            .with_dependencies(deps.iter().copied())
    }

    fn definitions(migrations: Vec<Migration>) -> BTreeMap<String, Migration> {
        migrations
            .into_iter()
            .map(|m| (m.version().to_string(), m))
            .collect()
    }

    #[test]
    fn test_dependency_order() {
        let defs = definitions(vec![
            migration("20240102_0000", &["20240101_0000"]),
            migration("20240101_0000", &[]),
        ]);

        let plan = resolve(&defs, &BTreeSet::new(), None);
        assert_eq!(plan.versions(), vec!["20240101_0000", "20240102_0000"]);
        assert!(plan.blocked.is_empty());

        let applied: BTreeSet<String> = ["20240101_0000".to_string()].into();
        let plan = resolve(&defs, &applied, None);
        assert_eq!(plan.versions(), vec!["20240102_0000"]);
    }

    #[test]
    fn test_unsatisfiable_dependency_is_blocked() {
        let defs = definitions(vec![
            migration("20240101_0000", &[]),
            migration("20240104_0000", &["20240103_0000"]),
        ]);

        let plan = resolve(&defs, &BTreeSet::new(), None);
        assert_eq!(plan.versions(), vec!["20240101_0000"]);
        assert_eq!(
            plan.blocked,
            vec![BlockedMigration {
                version: "20240104_0000".to_string(),
                unmet: vec!["20240103_0000".to_string()],
            }]
        );
    }

    #[test]
    fn test_later_dependency_does_not_count() {
        // v1 depends on v2, which sorts after it: v1 is blocked even though
        // v2 itself is pending in the same batch.
        let defs = definitions(vec![migration("v1", &["v2"]), migration("v2", &[])]);
        let plan = resolve(&defs, &BTreeSet::new(), None);
        assert_eq!(plan.versions(), vec!["v2"]);
        assert_eq!(plan.blocked[0].version, "v1");
    }

    #[test]
    fn test_blocked_dependency_blocks_dependents() {
        let defs = definitions(vec![
            migration("v1", &["missing"]),
            migration("v2", &["v1"]),
        ]);
        let plan = resolve(&defs, &BTreeSet::new(), None);
        assert!(plan.is_empty());
        assert_eq!(plan.blocked.len(), 2);
        assert_eq!(plan.blocked[1].unmet, vec!["v1".to_string()]);
    }

    #[test]
    fn test_target_limits_batch() {
        let defs = definitions(vec![migration("v1", &[]), migration("v2", &[]), migration("v3", &[])]);
        let plan = resolve(&defs, &BTreeSet::new(), Some("v2"));
        assert_eq!(plan.versions(), vec!["v1", "v2"]);
    }
}
