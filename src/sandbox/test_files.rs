//! Recognition of test files and the hidden directory they are moved into.
//!
//! One pattern set governs both what the candidate never sees and where the
//! command runner looks for the test suite.

use std::sync::LazyLock;

use regex::RegexSet;

/// Directory, relative to the project root, holding the relocated test suite.
pub const HIDDEN_TEST_DIR: &str = ".atrium_tests";

static TEST_FILE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"^test_",
        r"_test\.",
        r"\.test\.",
        r"\.spec\.",
        r"^tests/",
        r"^__tests__/",
        r"^\.atrium_tests",
        r"conftest\.py$",
        r"jest\.config",
        r"pytest\.ini$",
        r"\.pytest_cache",
    ])
    .expect("test file patterns are compile-time constants")
});

/// True when `path` (relative to the project root) names test code or test config.
///
/// Patterns are checked against both the bare file name and the full path, so
/// `src/test_utils.py` and `tests/helpers.py` are both hidden.
pub fn is_test_file(path: &str) -> bool {
    let path = path.trim_start_matches("./");
    let filename = path.rsplit('/').next().unwrap_or(path);
    TEST_FILE_PATTERNS.is_match(filename) || TEST_FILE_PATTERNS.is_match(path)
}

/// Shell snippet relocating test files under `project_root` into [`HIDDEN_TEST_DIR`].
///
/// Walks the whole tree, skipping `node_modules` and `.git`. Each match keeps its
/// path relative to the project root, so `src/app.spec.ts` lands at
/// `.atrium_tests/src/app.spec.ts`. Directories named `tests` or `__tests__` move as a
/// whole.
pub fn relocation_script(project_root: &str) -> String {
    format!(
        "mkdir -p {root}/{hidden} && cd {root} && \
         find . \\( -path ./node_modules -o -path ./.git -o -path ./{hidden} \\) -prune -o \
         -type d \\( -name tests -o -name __tests__ \\) -print -prune -o \
         -type f \\( -name 'test_*' -o -name '*_test.*' -o -name '*.test.*' -o -name '*.spec.*' \
         -o -name conftest.py -o -name pytest.ini -o -name 'jest.config*' \\) -print | \
         while IFS= read -r f; do \
         f=\"${{f#./}}\"; \
         mkdir -p \"{hidden}/$(dirname \"$f\")\" && mv \"$f\" \"{hidden}/$f\"; \
         done; true",
        root = project_root,
        hidden = HIDDEN_TEST_DIR
    )
}
