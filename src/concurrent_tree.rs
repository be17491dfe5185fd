//! Parent-before-child parallel traversal of target paths.
//!
//! Paths are arranged into a tree by component. Walking visits a node, then
//! fans out over its children with rayon. A node is therefore never visited
//! before its parent; sibling subtrees run in any relative order.
//!
//! Only requested paths are visited. Intermediate directories that were not
//! requested still order their descendants but are not passed to the visitor.
use std::collections::BTreeMap;

use anyhow::Result;
use rayon::prelude::*;

use crate::relpath::RelPath;

#[derive(Debug, Default)]
struct Node {
    requested: bool,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn insert<'a>(&mut self, mut components: impl Iterator<Item = &'a str>) {
        match components.next() {
            Some(name) => self
                .children
                .entry(name.to_string())
                .or_default()
                .insert(components),
            None => self.requested = true,
        }
    }

    fn walk<F>(&self, path: &RelPath, parallel: bool, visit: &F) -> Result<()>
    where
        F: Fn(&RelPath) -> Result<()> + Sync,
    {
        if self.requested && !path.is_empty() {
            visit(path)?;
        }
        self.walk_children(path, parallel, visit)
    }

    fn walk_children<F>(&self, path: &RelPath, parallel: bool, visit: &F) -> Result<()>
    where
        F: Fn(&RelPath) -> Result<()> + Sync,
    {
        if parallel {
            // Collect every sibling's result so that a failure in one subtree
            // does not stop the others.
            let results: Vec<Result<()>> = self
                .children
                .par_iter()
                .map(|(name, child)| child.walk(&path.join(name), parallel, visit))
                .collect();
            results.into_iter().collect()
        } else {
            let mut first_err = None;
            for (name, child) in &self.children {
                if let Err(e) = child.walk(&path.join(name), parallel, visit) {
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        }
    }
}

/// A set of target paths that can be walked parents first.
#[derive(Debug, Default)]
pub struct ConcurrentTree {
    root: Node,
}

impl ConcurrentTree {
    /// Tree over `paths`. Duplicates are visited once.
    pub fn new<'a>(paths: impl IntoIterator<Item = &'a RelPath>) -> Self {
        let mut root = Node::default();
        for path in paths {
            root.insert(path.components());
        }
        Self { root }
    }

    /// Visit every requested path, parents before children.
    ///
    /// With `parallel` unset the walk is sequential in sorted order, which
    /// keeps the same ordering guarantee and makes output deterministic.
    ///
    /// # Errors
    ///
    /// Returns the first error from `visit` in path order once every
    /// subtree has finished. Descendants of a failed node are not visited.
    pub fn walk<F>(&self, parallel: bool, visit: F) -> Result<()>
    where
        F: Fn(&RelPath) -> Result<()> + Sync,
    {
        self.root.walk(&RelPath::root(), parallel, &visit)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use proptest::prelude::*;

    fn paths(names: &[&str]) -> Vec<RelPath> {
        names.iter().map(|n| RelPath::new(n)).collect()
    }

    fn visit_order(tree: &ConcurrentTree, parallel: bool) -> Vec<RelPath> {
        let seen = Mutex::new(Vec::new());
        tree.walk(parallel, |p| {
            seen.lock().unwrap().push(p.clone());
            Ok(())
        })
        .unwrap();
        seen.into_inner().unwrap()
    }

    #[test]
    fn sequential_walk_is_sorted() {
        let input = paths(&["b", "a/y", "a", "a/x"]);
        let tree = ConcurrentTree::new(&input);
        assert_eq!(visit_order(&tree, false), paths(&["a", "a/x", "a/y", "b"]));
    }

    #[test]
    fn unrequested_intermediates_are_not_visited() {
        let input = paths(&["a/b/c"]);
        let tree = ConcurrentTree::new(&input);
        assert_eq!(visit_order(&tree, true), paths(&["a/b/c"]));
    }

    #[test]
    fn error_does_not_stop_siblings() {
        let input = paths(&["bad", "bad/child", "good", "good/child"]);
        let tree = ConcurrentTree::new(&input);
        let seen = Mutex::new(Vec::new());
        let err = tree
            .walk(true, |p| {
                seen.lock().unwrap().push(p.to_string());
                if p.as_str() == "bad" {
                    anyhow::bail!("boom");
                }
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["bad", "good", "good/child"]);
    }

    #[test]
    fn empty_tree_visits_nothing() {
        let tree = ConcurrentTree::new(&Vec::<RelPath>::new());
        assert!(visit_order(&tree, true).is_empty());
    }

    fn path_strategy() -> impl Strategy<Value = Vec<RelPath>> {
        prop::collection::vec(
            prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "d"]), 1..5),
            0..40,
        )
        .prop_map(|v| v.into_iter().map(|c| RelPath::new(&c.join("/"))).collect())
    }

    proptest! {
        #[test]
        fn parents_first_and_each_path_once(input in path_strategy(), parallel in any::<bool>()) {
            let tree = ConcurrentTree::new(&input);
            let order = visit_order(&tree, parallel);

            let mut expected: Vec<RelPath> = input.clone();
            expected.sort();
            expected.dedup();
            let mut sorted = order.clone();
            sorted.sort();
            prop_assert_eq!(&sorted, &expected);

            let position: HashMap<&RelPath, usize> =
                order.iter().enumerate().map(|(i, p)| (p, i)).collect();
            for (i, path) in order.iter().enumerate() {
                let mut ancestor = path.parent();
                while let Some(a) = ancestor {
                    if let Some(&j) = position.get(&a) {
                        prop_assert!(j < i, "{} visited before its ancestor {}", path, a);
                    }
                    ancestor = a.parent();
                }
            }
        }
    }
}
