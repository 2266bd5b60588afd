//! Dispatch schedule derived from a dependency graph

/// Node ids grouped into dependency levels
///
/// Produced by [`DependencyGraph::schedule`](super::DependencyGraph::schedule).
/// Each level's nodes are mutually independent; a level is dispatched only
/// once every node in the levels before it is resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    levels: Vec<Vec<String>>,
}

impl Schedule {
    pub(super) fn new(levels: Vec<Vec<String>>) -> Self {
        Self { levels }
    }

    /// The levels, innermost first
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Number of levels
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Iterate all node ids in creation order, level by level
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().flatten().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_is_level_order() {
        let schedule = Schedule::new(vec![
            vec!["db".to_string(), "cache".to_string()],
            vec!["app".to_string()],
        ]);
        assert_eq!(schedule.depth(), 2);
        assert_eq!(schedule.iter().collect::<Vec<_>>(), vec!["db", "cache", "app"]);
    }
}
