//! Suite tree models
//!
//! A file suite is declared through the builder methods on [`Suite`], then
//! bound to a project (test ids, inherited retries/timeout, static
//! annotations) before it is grouped and scheduled.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::test_result::{Annotation, Location, TestError, TestResult, TestStatus};
use crate::config::ProjectConfig;
use crate::error::CoreError;
use crate::fixtures::{FixtureArgs, FixtureLayer, FixturePool, TestType};
use crate::worker::TestInfo;

/// Test bodies and hooks receive their requested fixtures and the attempt's
/// [`TestInfo`].
pub type TestFn =
    Arc<dyn Fn(FixtureArgs, TestInfo) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Conditional modifiers decide from fixtures whether they apply.
pub type ModifierFn =
    Arc<dyn Fn(FixtureArgs) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteType {
    Root,
    Project,
    File,
    Describe,
}

/// `None` means the suite did not configure a mode and inherits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    #[default]
    None,
    Default,
    Serial,
    Parallel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookType {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::BeforeAll => "beforeAll",
            HookType::AfterAll => "afterAll",
            HookType::BeforeEach => "beforeEach",
            HookType::AfterEach => "afterEach",
        }
    }

    pub fn is_all_hook(&self) -> bool {
        matches!(self, HookType::BeforeAll | HookType::AfterAll)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifierType {
    Skip,
    Fixme,
    Fail,
    Slow,
}

impl ModifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifierType::Skip => "skip",
            ModifierType::Fixme => "fixme",
            ModifierType::Fail => "fail",
            ModifierType::Slow => "slow",
        }
    }
}

impl fmt::Display for ModifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct Hook {
    pub kind: HookType,
    pub title: String,
    pub location: Location,
    pub deps: Vec<String>,
    pub func: TestFn,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("kind", &self.kind)
            .field("title", &self.title)
            .field("location", &self.location)
            .field("deps", &self.deps)
            .finish()
    }
}

#[derive(Clone)]
pub struct Modifier {
    pub kind: ModifierType,
    pub location: Location,
    pub deps: Vec<String>,
    pub description: Option<String>,
    pub func: ModifierFn,
}

impl fmt::Debug for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modifier")
            .field("kind", &self.kind)
            .field("location", &self.location)
            .field("deps", &self.deps)
            .field("description", &self.description)
            .finish()
    }
}

/// What scheduling needs to know about one enclosing suite of a test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuiteInfo {
    /// Unique per suite instance within a project and repeat index.
    pub key: String,
    pub kind: SuiteType,
    pub title: String,
    pub parallel_mode: ParallelMode,
    pub has_all_hooks: bool,
}

#[derive(Clone)]
pub struct TestCase {
    pub title: String,
    pub location: Location,
    pub deps: Vec<String>,
    pub func: TestFn,
    pub test_type: Arc<TestType>,

    /// Annotations written on the test itself.
    pub static_annotations: Vec<Annotation>,
    /// Suite and test annotations after binding.
    pub annotations: Vec<Annotation>,
    pub expected_status: TestStatus,
    pub timeout: u64,
    pub retries: u32,
    pub repeat_each_index: u32,

    pub id: String,
    pub project_id: String,
    pub require_file: String,
    pub title_path: Vec<String>,
    /// Enclosing suites, outermost first.
    pub parents: Vec<SuiteInfo>,

    pub pool_digest: String,
    pub worker_hash: String,
    pub pool: Option<Arc<FixturePool>>,
    pub load_errors: Vec<TestError>,

    pub results: Vec<TestResult>,
    /// Position in the run, used to restore declaration order.
    pub ordinal: usize,
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("title_path", &self.title_path)
            .field("expected_status", &self.expected_status)
            .field("retries", &self.retries)
            .field("worker_hash", &self.worker_hash)
            .field("results", &self.results.len())
            .finish()
    }
}

impl TestCase {
    /// Titles joined for display, skipping empty ones.
    pub fn full_title(&self) -> String {
        self.title_path
            .iter()
            .filter(|t| !t.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" › ")
    }

    /// Text matched by the title filter.
    pub fn grep_title(&self) -> String {
        self.title_path.join(" ")
    }

    pub fn skip(&mut self, description: Option<&str>) -> &mut Self {
        self.annotate_static(ModifierType::Skip, description)
    }

    pub fn fixme(&mut self, description: Option<&str>) -> &mut Self {
        self.annotate_static(ModifierType::Fixme, description)
    }

    pub fn fail(&mut self, description: Option<&str>) -> &mut Self {
        self.annotate_static(ModifierType::Fail, description)
    }

    pub fn slow(&mut self, description: Option<&str>) -> &mut Self {
        self.annotate_static(ModifierType::Slow, description)
    }

    pub fn annotate(&mut self, kind: impl Into<String>, description: Option<&str>) -> &mut Self {
        self.static_annotations
            .push(Annotation::new(kind, description.map(str::to_string)));
        self
    }

    fn annotate_static(&mut self, kind: ModifierType, description: Option<&str>) -> &mut Self {
        self.annotate(kind.as_str(), description)
    }

    pub fn append_result(&mut self) -> &mut TestResult {
        let retry = self.results.len() as u32;
        self.results.push(TestResult::new(retry));
        let last = self.results.len() - 1;
        &mut self.results[last]
    }

    /// Status of the last attempt.
    pub fn last_status(&self) -> Option<TestStatus> {
        self.results.last().map(|r| r.status)
    }

    /// Outermost enclosing serial suite.
    pub fn outermost_serial_suite(&self) -> Option<&SuiteInfo> {
        self.parents
            .iter()
            .find(|s| s.parallel_mode == ParallelMode::Serial)
    }

    pub fn is_in_suite(&self, key: &str) -> bool {
        self.parents.iter().any(|s| s.key == key)
    }
}

#[derive(Clone, Debug)]
pub enum SuiteEntry {
    Suite(Suite),
    Test(TestCase),
}

#[derive(Clone, Debug)]
pub struct Suite {
    pub title: String,
    pub kind: SuiteType,
    pub location: Option<Location>,
    pub file: String,
    pub entries: Vec<SuiteEntry>,
    pub hooks: Vec<Hook>,
    pub modifiers: Vec<Modifier>,
    /// Unconditional skip/fixme/fail/slow annotations.
    pub annotations: Vec<Annotation>,
    pub parallel_mode: ParallelMode,
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    /// Fixture overrides from `use_fixtures`.
    pub fixture_overrides: Vec<FixtureLayer>,
    pub key: String,

    test_type: Arc<TestType>,
    inside_serial: bool,
    errors: Vec<TestError>,
}

impl Suite {
    fn new(title: impl Into<String>, kind: SuiteType, file: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind,
            location: None,
            file: file.into(),
            entries: Vec::new(),
            hooks: Vec::new(),
            modifiers: Vec::new(),
            annotations: Vec::new(),
            parallel_mode: ParallelMode::None,
            timeout: None,
            retries: None,
            fixture_overrides: Vec::new(),
            key: String::new(),
            test_type: TestType::base(),
            inside_serial: false,
            errors: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new("", SuiteType::Root, "")
    }

    pub fn project(name: impl Into<String>) -> Self {
        Self::new(name, SuiteType::Project, "")
    }

    /// Top-level suite of a test file.
    pub fn file(file: impl Into<String>) -> Self {
        let file = file.into();
        let mut suite = Self::new(file.clone(), SuiteType::File, file.clone());
        suite.location = Some(Location::new(file, 0, 0));
        suite
    }

    /// Test type used by tests declared after this call.
    pub fn with_test_type(&mut self, test_type: Arc<TestType>) -> &mut Self {
        self.test_type = test_type;
        self
    }

    #[track_caller]
    pub fn test<F, Fut>(&mut self, title: impl Into<String>, deps: &[&str], f: F) -> &mut TestCase
    where
        F: Fn(FixtureArgs, TestInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let location = Location::caller();
        let func: TestFn = Arc::new(move |args, info| f(args, info).boxed());
        let test = TestCase {
            title: title.into(),
            location,
            deps: names(deps),
            func,
            test_type: self.test_type.clone(),
            static_annotations: Vec::new(),
            annotations: Vec::new(),
            expected_status: TestStatus::Passed,
            timeout: 0,
            retries: 0,
            repeat_each_index: 0,
            id: String::new(),
            project_id: String::new(),
            require_file: self.file.clone(),
            title_path: Vec::new(),
            parents: Vec::new(),
            pool_digest: String::new(),
            worker_hash: String::new(),
            pool: None,
            load_errors: Vec::new(),
            results: Vec::new(),
            ordinal: 0,
        };
        self.entries.push(SuiteEntry::Test(test));
        match self.entries.last_mut() {
            Some(SuiteEntry::Test(test)) => test,
            _ => unreachable!("a test was just pushed"),
        }
    }

    #[track_caller]
    pub fn describe(&mut self, title: impl Into<String>, body: impl FnOnce(&mut Suite)) -> &mut Self {
        self.describe_with_mode(title, ParallelMode::None, body)
    }

    #[track_caller]
    pub fn describe_serial(
        &mut self,
        title: impl Into<String>,
        body: impl FnOnce(&mut Suite),
    ) -> &mut Self {
        self.describe_with_mode(title, ParallelMode::Serial, body)
    }

    #[track_caller]
    pub fn describe_parallel(
        &mut self,
        title: impl Into<String>,
        body: impl FnOnce(&mut Suite),
    ) -> &mut Self {
        self.describe_with_mode(title, ParallelMode::Parallel, body)
    }

    #[track_caller]
    fn describe_with_mode(
        &mut self,
        title: impl Into<String>,
        mode: ParallelMode,
        body: impl FnOnce(&mut Suite),
    ) -> &mut Self {
        let location = Location::caller();
        let mut child = Suite::new(title, SuiteType::Describe, self.file.clone());
        child.location = Some(location);
        child.test_type = self.test_type.clone();
        child.inside_serial = self.inside_serial || self.parallel_mode == ParallelMode::Serial;
        if mode != ParallelMode::None {
            if let Err(e) = child.configure(mode) {
                child.record_error(e);
            }
        }
        body(&mut child);
        self.entries.push(SuiteEntry::Suite(child));
        self
    }

    /// Change the parallel mode of this suite.
    #[track_caller]
    pub fn configure(&mut self, mode: ParallelMode) -> Result<(), CoreError> {
        let location = self.location.clone().unwrap_or_else(Location::caller);
        if mode == ParallelMode::Parallel && self.inside_serial {
            return Err(CoreError::ParallelInsideSerial { location });
        }
        if mode == ParallelMode::Serial && self.has_parallel_descendant() {
            return Err(CoreError::ParallelInsideSerial { location });
        }
        self.parallel_mode = mode;
        Ok(())
    }

    fn has_parallel_descendant(&self) -> bool {
        self.entries.iter().any(|e| match e {
            SuiteEntry::Suite(s) => {
                s.parallel_mode == ParallelMode::Parallel || s.has_parallel_descendant()
            }
            SuiteEntry::Test(_) => false,
        })
    }

    fn record_error(&mut self, error: CoreError) {
        let location = match &error {
            CoreError::ParallelInsideSerial { location } => Some(location.clone()),
            _ => self.location.clone(),
        };
        let mut test_error = TestError::new(error.to_string());
        test_error.location = location;
        self.errors.push(test_error);
    }

    #[track_caller]
    pub fn before_all<F, Fut>(&mut self, deps: &[&str], f: F) -> &mut Self
    where
        F: Fn(FixtureArgs, TestInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook(HookType::BeforeAll, Location::caller(), deps, f)
    }

    #[track_caller]
    pub fn after_all<F, Fut>(&mut self, deps: &[&str], f: F) -> &mut Self
    where
        F: Fn(FixtureArgs, TestInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook(HookType::AfterAll, Location::caller(), deps, f)
    }

    #[track_caller]
    pub fn before_each<F, Fut>(&mut self, deps: &[&str], f: F) -> &mut Self
    where
        F: Fn(FixtureArgs, TestInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook(HookType::BeforeEach, Location::caller(), deps, f)
    }

    #[track_caller]
    pub fn after_each<F, Fut>(&mut self, deps: &[&str], f: F) -> &mut Self
    where
        F: Fn(FixtureArgs, TestInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook(HookType::AfterEach, Location::caller(), deps, f)
    }

    fn hook<F, Fut>(&mut self, kind: HookType, location: Location, deps: &[&str], f: F) -> &mut Self
    where
        F: Fn(FixtureArgs, TestInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let func: TestFn = Arc::new(move |args, info| f(args, info).boxed());
        self.hooks.push(Hook {
            kind,
            title: format!("{} hook", kind.as_str()),
            location,
            deps: names(deps),
            func,
        });
        self
    }

    /// Conditional modifier evaluated in the worker for each test of the
    /// suite.
    #[track_caller]
    pub fn modifier<F, Fut>(
        &mut self,
        kind: ModifierType,
        deps: &[&str],
        description: Option<&str>,
        f: F,
    ) -> &mut Self
    where
        F: Fn(FixtureArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let func: ModifierFn = Arc::new(move |args| f(args).boxed());
        self.modifiers.push(Modifier {
            kind,
            location: Location::caller(),
            deps: names(deps),
            description: description.map(str::to_string),
            func,
        });
        self
    }

    pub fn skip(&mut self, description: Option<&str>) -> &mut Self {
        self.annotate(ModifierType::Skip.as_str(), description)
    }

    pub fn fixme(&mut self, description: Option<&str>) -> &mut Self {
        self.annotate(ModifierType::Fixme.as_str(), description)
    }

    pub fn fail(&mut self, description: Option<&str>) -> &mut Self {
        self.annotate(ModifierType::Fail.as_str(), description)
    }

    pub fn slow(&mut self, description: Option<&str>) -> &mut Self {
        self.annotate(ModifierType::Slow.as_str(), description)
    }

    pub fn annotate(&mut self, kind: impl Into<String>, description: Option<&str>) -> &mut Self {
        self.annotations
            .push(Annotation::new(kind, description.map(str::to_string)));
        self
    }

    /// Override fixtures for every test in this suite.
    pub fn use_fixtures(&mut self, layer: FixtureLayer) -> &mut Self {
        self.fixture_overrides.push(layer);
        self
    }

    pub fn set_timeout(&mut self, timeout_ms: u64) -> &mut Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn set_retries(&mut self, retries: u32) -> &mut Self {
        self.retries = Some(retries);
        self
    }

    pub fn add_suite(&mut self, suite: Suite) {
        self.entries.push(SuiteEntry::Suite(suite));
    }

    pub fn has_all_hooks(&self) -> bool {
        self.hooks.iter().any(|h| h.kind.is_all_hook())
    }

    /// Errors recorded while declaring this suite and its descendants.
    pub fn load_errors(&self) -> Vec<TestError> {
        let mut errors = self.errors.clone();
        for entry in &self.entries {
            if let SuiteEntry::Suite(suite) = entry {
                errors.extend(suite.load_errors());
            }
        }
        errors
    }

    pub fn all_tests(&self) -> Vec<&TestCase> {
        let mut tests = Vec::new();
        self.for_each_test(&mut |t| tests.push(t));
        tests
    }

    pub fn for_each_test<'a>(&'a self, visit: &mut dyn FnMut(&'a TestCase)) {
        for entry in &self.entries {
            match entry {
                SuiteEntry::Suite(suite) => suite.for_each_test(visit),
                SuiteEntry::Test(test) => visit(test),
            }
        }
    }

    pub fn for_each_test_mut(&mut self, visit: &mut dyn FnMut(&mut TestCase)) {
        for entry in &mut self.entries {
            match entry {
                SuiteEntry::Suite(suite) => suite.for_each_test_mut(visit),
                SuiteEntry::Test(test) => visit(test),
            }
        }
    }

    pub fn has_tests(&self) -> bool {
        self.entries.iter().any(|e| match e {
            SuiteEntry::Suite(s) => s.has_tests(),
            SuiteEntry::Test(_) => true,
        })
    }

    /// Move every test out of the tree, in declaration order.
    pub fn into_tests(self) -> Vec<TestCase> {
        let mut tests = Vec::new();
        for entry in self.entries {
            match entry {
                SuiteEntry::Suite(suite) => tests.extend(suite.into_tests()),
                SuiteEntry::Test(test) => tests.push(test),
            }
        }
        tests
    }
}

fn names(deps: &[&str]) -> Vec<String> {
    deps.iter().map(|d| d.to_string()).collect()
}

/// Drop tests rejected by `keep` and every suite left without tests.
pub fn filter_tests_remove_empty_suites(suite: &mut Suite, keep: &mut dyn FnMut(&TestCase) -> bool) {
    suite.entries.retain_mut(|entry| match entry {
        SuiteEntry::Suite(child) => {
            filter_tests_remove_empty_suites(child, keep);
            child.has_tests()
        }
        SuiteEntry::Test(test) => keep(test),
    });
}

/// Bind a file suite to `project` for one repeat index: assigns test ids,
/// title paths, inherited retries and timeout and the expected status
/// implied by static annotations.
///
/// `fully_parallel` projects contribute a parallel project-level suite to
/// every test's parents.
pub fn bind_file_suite_to_project(
    project: &ProjectConfig,
    file_suite: &Suite,
    repeat_each_index: u32,
) -> Suite {
    let mut result = file_suite.clone();
    let file_id = file_id(&result.file);
    let project_info = SuiteInfo {
        key: format!("{}#{}", project.id, repeat_each_index),
        kind: SuiteType::Project,
        title: project.name.clone(),
        parallel_mode: if project.fully_parallel {
            ParallelMode::Parallel
        } else {
            ParallelMode::None
        },
        has_all_hooks: false,
    };
    let context = BindContext {
        project,
        file_id: &file_id,
        repeat_each_index,
    };
    let mut chain = vec![project_info];
    let mut inherited = Inherited {
        annotations: Vec::new(),
        retries: None,
        timeout: None,
    };
    bind_suite(&context, &mut result, "0", &mut chain, &mut inherited, &mut Vec::new());
    result
}

struct BindContext<'a> {
    project: &'a ProjectConfig,
    file_id: &'a str,
    repeat_each_index: u32,
}

#[derive(Clone)]
struct Inherited {
    annotations: Vec<Annotation>,
    retries: Option<u32>,
    timeout: Option<u64>,
}

fn bind_suite(
    context: &BindContext<'_>,
    suite: &mut Suite,
    path: &str,
    chain: &mut Vec<SuiteInfo>,
    inherited: &mut Inherited,
    titles: &mut Vec<String>,
) {
    suite.key = format!(
        "{}#{}:{}:{}",
        context.project.id, context.repeat_each_index, suite.file, path
    );
    chain.push(SuiteInfo {
        key: suite.key.clone(),
        kind: suite.kind,
        title: suite.title.clone(),
        parallel_mode: suite.parallel_mode,
        has_all_hooks: suite.has_all_hooks(),
    });
    titles.push(suite.title.clone());

    let saved = inherited.clone();
    inherited.annotations.extend(suite.annotations.iter().cloned());
    if suite.retries.is_some() {
        inherited.retries = suite.retries;
    }
    if suite.timeout.is_some() {
        inherited.timeout = suite.timeout;
    }

    for (index, entry) in suite.entries.iter_mut().enumerate() {
        match entry {
            SuiteEntry::Suite(child) => {
                let child_path = format!("{path}.{index}");
                bind_suite(context, child, &child_path, chain, inherited, titles);
            }
            SuiteEntry::Test(test) => bind_test(context, test, chain, inherited, titles),
        }
    }

    *inherited = saved;
    titles.pop();
    chain.pop();
}

fn bind_test(
    context: &BindContext<'_>,
    test: &mut TestCase,
    chain: &[SuiteInfo],
    inherited: &Inherited,
    titles: &[String],
) {
    let project = context.project;
    // titles[0] is the file suite title.
    let mut expression = format!(
        "[project={}]{}\x1e{}",
        project.id,
        titles.first().map(String::as_str).unwrap_or(""),
        titles[1.min(titles.len())..]
            .iter()
            .cloned()
            .chain(std::iter::once(test.title.clone()))
            .collect::<Vec<_>>()
            .join("\x1e")
    );
    if context.repeat_each_index > 0 {
        expression.push_str(&format!(" (repeat:{})", context.repeat_each_index));
    }
    test.id = format!("{}-{}", context.file_id, &sha1_prefix(&expression));
    test.project_id = project.id.clone();
    test.repeat_each_index = context.repeat_each_index;
    test.parents = chain.to_vec();

    let mut title_path = vec![String::new(), project.name.clone()];
    title_path.extend(titles.iter().cloned());
    title_path.push(test.title.clone());
    test.title_path = title_path;

    test.annotations = inherited.annotations.clone();
    test.annotations.extend(test.static_annotations.iter().cloned());
    test.retries = inherited.retries.unwrap_or(project.retries);
    test.timeout = inherited.timeout.unwrap_or(project.timeout);
    test.expected_status = TestStatus::Passed;
    if test.annotations.iter().any(|a| a.kind == "fail") {
        test.expected_status = TestStatus::Failed;
    }
    if test
        .annotations
        .iter()
        .any(|a| a.kind == "skip" || a.kind == "fixme")
    {
        test.expected_status = TestStatus::Skipped;
    }
}

/// Identity of the worker a test can run in.
pub fn worker_hash(project_id: &str, pool_digest: &str, repeat_each_index: u32) -> String {
    format!("{project_id}-{pool_digest}-{repeat_each_index}")
}

fn file_id(file: &str) -> String {
    sha1_prefix(file)
}

fn sha1_prefix(text: &str) -> String {
    let mut hash = crate::fixtures::sha1_hex(text);
    hash.truncate(20);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file() -> Suite {
        let mut suite = Suite::file("math.spec");
        suite.test("adds", &[], |_args, _info| async { Ok(()) });
        suite.describe("group", |s| {
            s.set_retries(2).skip(Some("later"));
            s.test("nested", &[], |_args, _info| async { Ok(()) });
        });
        suite
    }

    #[test]
    fn test_binding_assigns_ids_and_inherits() {
        let project = ProjectConfig::new("chromium").with_retries(1).with_timeout(500);
        let bound = bind_file_suite_to_project(&project, &file(), 0);
        let tests = bound.all_tests();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].retries, 1);
        assert_eq!(tests[0].timeout, 500);
        assert_eq!(tests[0].expected_status, TestStatus::Passed);
        assert_eq!(tests[1].retries, 2);
        assert_eq!(tests[1].expected_status, TestStatus::Skipped);
        assert_eq!(tests[1].full_title(), "chromium › math.spec › group › nested");
        assert_eq!(tests[0].id.len(), 41);
        assert!(tests[0].id.starts_with(&tests[1].id[..20]));
        assert_ne!(tests[0].id, tests[1].id);
    }

    #[test]
    fn test_ids_are_stable_and_repeat_specific() {
        let project = ProjectConfig::new("p");
        let first = bind_file_suite_to_project(&project, &file(), 0);
        let second = bind_file_suite_to_project(&project, &file(), 0);
        let repeated = bind_file_suite_to_project(&project, &file(), 1);
        assert_eq!(first.all_tests()[0].id, second.all_tests()[0].id);
        assert_ne!(first.all_tests()[0].id, repeated.all_tests()[0].id);
        assert_eq!(repeated.all_tests()[0].repeat_each_index, 1);
    }

    #[test]
    fn test_parallel_inside_serial_is_a_load_error() {
        let mut suite = Suite::file("a.spec");
        suite.describe_serial("outer", |s| {
            s.describe_parallel("inner", |s| {
                s.test("t", &[], |_args, _info| async { Ok(()) });
            });
        });
        let errors = suite.load_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("cannot be nested inside describe.serial"));
    }

    #[test]
    fn test_filter_removes_empty_suites() {
        let mut suite = file();
        filter_tests_remove_empty_suites(&mut suite, &mut |t| t.title == "adds");
        assert_eq!(suite.entries.len(), 1);
        assert_eq!(suite.all_tests()[0].title, "adds");
    }

    #[test]
    fn test_fully_parallel_project_marks_parents() {
        let project = ProjectConfig::new("p").fully_parallel();
        let bound = bind_file_suite_to_project(&project, &file(), 0);
        let test = bound.all_tests()[0];
        assert_eq!(test.parents[0].parallel_mode, ParallelMode::Parallel);
        assert_eq!(test.parents[1].kind, SuiteType::File);
    }

    #[test]
    fn test_outermost_serial_suite() {
        let mut suite = Suite::file("a.spec");
        suite.describe_serial("outer", |s| {
            s.describe("inner", |s| {
                s.test("t", &[], |_args, _info| async { Ok(()) });
            });
        });
        let bound = bind_file_suite_to_project(&ProjectConfig::new("p"), &suite, 0);
        let test = bound.all_tests()[0];
        let serial = test.outermost_serial_suite().unwrap();
        assert_eq!(serial.title, "outer");
        assert!(test.is_in_suite(&serial.key));
    }
}
