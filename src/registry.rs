//! Resolves, per URL section, the ordered set of applicable test specs.

use crate::types::{TestGroup, TestSpec};

const ALL_SECTIONS: &str = "all";

/// Read-only view over the configured test groups.
///
/// Group order is the settings-file order; `all` groups always apply after
/// every section-specific group, so a section-scoped definition of a test id
/// wins over the `all` definition of the same id.
#[derive(Debug)]
pub struct TestRegistry {
    groups: Vec<Group>,
}

#[derive(Debug)]
struct Group {
    sections: Vec<String>,
    tests: Vec<TestSpec>,
}

impl Group {
    fn is_all(&self) -> bool {
        self.sections.iter().any(|s| s == ALL_SECTIONS)
    }
    fn covers(&self, section: &str) -> bool {
        self.sections.iter().any(|s| s == section)
    }
}

impl TestRegistry {
    pub fn new(groups: &[TestGroup]) -> Self {
        let groups = groups
            .iter()
            .map(|g| Group {
                sections: g
                    .sections
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                tests: g.tests.clone(),
            })
            .collect();
        Self { groups }
    }

    /// Ordered tests applying to `section`: section-specific groups first in
    /// file order, the `all` group(s) last; de-duplicated by test id, first
    /// occurrence wins.
    pub fn applicable_tests(&self, section: &str) -> Vec<&TestSpec> {
        let mut out: Vec<&TestSpec> = Vec::new();
        let specific = self.groups.iter().filter(|g| !g.is_all() && g.covers(section));
        let all = self.groups.iter().filter(|g| g.is_all());
        for group in specific.chain(all) {
            for spec in &group.tests {
                if !out.iter().any(|t| t.id == spec.id) {
                    out.push(spec);
                }
            }
        }
        out
    }
}
