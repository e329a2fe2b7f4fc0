//! Test groups and sharding
//!
//! A group is the unit of work handed to one worker: tests that share a
//! worker hash and a file, in the order they must run.

use indexmap::IndexMap;

use crate::config::Shard;
use crate::models::{ParallelMode, TestCase};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestGroup {
    pub worker_hash: String,
    pub require_file: String,
    pub repeat_each_index: u32,
    pub project_id: String,
    /// Test ids, in run order.
    pub tests: Vec<String>,
}

impl TestGroup {
    fn for_test(test: &TestCase) -> Self {
        Self {
            worker_hash: test.worker_hash.clone(),
            require_file: test.require_file.clone(),
            repeat_each_index: test.repeat_each_index,
            project_id: test.project_id.clone(),
            tests: Vec::new(),
        }
    }

    /// Same group identity, different tests.
    pub fn with_tests(&self, tests: Vec<String>) -> Self {
        Self {
            tests,
            ..self.clone()
        }
    }
}

struct FileBuckets {
    general: TestGroup,
    /// Keyed by the outermost sequential suite, or by the test itself.
    parallel: IndexMap<String, TestGroup>,
    parallel_with_hooks: TestGroup,
}

/// Partition `tests` (all tests of the run, in declaration order) into
/// groups.
pub fn create_test_groups(tests: &[&TestCase], workers: usize) -> Vec<TestGroup> {
    let mut groups: IndexMap<String, IndexMap<String, FileBuckets>> = IndexMap::new();

    for test in tests {
        let with_require_file = groups
            .entry(test.worker_hash.clone())
            .or_default()
            .entry(test.require_file.clone())
            .or_insert_with(|| FileBuckets {
                general: TestGroup::for_test(test),
                parallel: IndexMap::new(),
                parallel_with_hooks: TestGroup::for_test(test),
            });

        let inside_parallel = test
            .parents
            .iter()
            .any(|p| p.parallel_mode == ParallelMode::Parallel);
        let has_all_hooks = test.parents.iter().any(|p| p.has_all_hooks);
        let outermost_sequential = test.parents.iter().find(|p| {
            matches!(p.parallel_mode, ParallelMode::Serial | ParallelMode::Default)
        });

        if !inside_parallel {
            with_require_file.general.tests.push(test.id.clone());
        } else if has_all_hooks && outermost_sequential.is_none() {
            with_require_file.parallel_with_hooks.tests.push(test.id.clone());
        } else {
            let key = outermost_sequential.map_or_else(|| test.id.clone(), |s| s.key.clone());
            with_require_file
                .parallel
                .entry(key)
                .or_insert_with(|| TestGroup::for_test(test))
                .tests
                .push(test.id.clone());
        }
    }

    let mut result = Vec::new();
    for with_worker_hash in groups.into_values() {
        for buckets in with_worker_hash.into_values() {
            if !buckets.general.tests.is_empty() {
                result.push(buckets.general);
            }
            result.extend(buckets.parallel.into_values());

            let with_hooks = buckets.parallel_with_hooks;
            let chunk_size = with_hooks.tests.len().div_ceil(workers.max(1)).max(1);
            for chunk in with_hooks.tests.chunks(chunk_size) {
                result.push(with_hooks.with_tests(chunk.to_vec()));
            }
        }
    }
    result
}

/// Groups of shard `shard.current` (1-based) out of `shard.total`. A group
/// belongs to the shard its first test falls into.
pub fn filter_for_shard(shard: &Shard, groups: Vec<TestGroup>) -> Vec<TestGroup> {
    let total = shard.total.max(1) as usize;
    let index = (shard.current.max(1) as usize - 1).min(total - 1);
    let tests_count: usize = groups.iter().map(|g| g.tests.len()).sum();

    let shard_size = tests_count / total;
    let extra = tests_count % total;
    let from = shard_size * index + index.min(extra);
    let to = from + shard_size + usize::from(index < extra);

    let mut current = 0;
    let mut result = Vec::new();
    for group in groups {
        let first = current;
        current += group.tests.len();
        if first >= from && first < to {
            result.push(group);
        }
    }
    result
}
