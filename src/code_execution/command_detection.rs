//! Picks the run and test commands for a challenge from its file set.

use std::collections::BTreeMap;

use log::debug;
use serde::Deserialize;

use crate::sandbox::test_files::{is_test_file, HIDDEN_TEST_DIR};

#[derive(Deserialize, Default)]
struct PackageManifest {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

/// Language families, in the order they are tried.
const ENTRY_POINTS: [(&str, [&str; 2], &str); 3] = [
    (".py", ["main.py", "app.py"], "python"),
    (".ts", ["index.ts", "main.ts"], "npx tsx"),
    (".js", ["index.js", "main.js"], "node"),
];

/// Command used when there is no stored file set at all.
pub fn missing_files_command(project_root: &str) -> String {
    format!("cd {} && echo \"No challenge files found\"", project_root)
}

/// Resolves how to run the project.
///
/// A package manifest's `start` script wins, then its `dev` script. Otherwise
/// the first language with any source file decides: a conventional entry file
/// if present, else the first source file of that language.
pub fn detect_run_command(files: &BTreeMap<String, String>, project_root: &str) -> String {
    if let Some(raw) = files.get("package.json") {
        match serde_json::from_str::<PackageManifest>(raw) {
            Ok(manifest) => {
                if manifest.scripts.contains_key("start") {
                    return format!("cd {} && npm start", project_root);
                }
                if manifest.scripts.contains_key("dev") {
                    return format!("cd {} && npm run dev", project_root);
                }
            }
            Err(e) => debug!("Ignoring unparseable package.json: {}", e),
        }
    }

    for (extension, entries, runner) in ENTRY_POINTS {
        let mut sources = files
            .keys()
            .filter(|f| f.ends_with(extension) && !is_test_file(f));
        let Some(first) = sources.next() else {
            continue;
        };
        let entry = entries
            .iter()
            .find(|e| files.contains_key(**e))
            .copied()
            .unwrap_or(first.as_str());
        return format!("cd {} && {} {}", project_root, runner, entry);
    }

    format!("cd {} && echo \"No runnable file detected\"", project_root)
}

/// Resolves the test suite command, run against the hidden test directory.
pub fn detect_test_command(files: &BTreeMap<String, String>, project_root: &str) -> Option<String> {
    let has = |exts: &[&str]| files.keys().any(|f| exts.iter().any(|e| f.ends_with(e)));
    if has(&[".py"]) {
        Some(format!(
            "cd {} && python -m pytest {}/ -v 2>&1",
            project_root, HIDDEN_TEST_DIR
        ))
    } else if has(&[".ts", ".tsx", ".js", ".jsx"]) {
        Some(format!(
            "cd {} && npx jest --roots {}/ 2>&1",
            project_root, HIDDEN_TEST_DIR
        ))
    } else {
        None
    }
}

/// Prints the first entry of the hidden test directory, if any.
pub fn test_probe_command(project_root: &str) -> String {
    format!("ls {}/{}/ 2>/dev/null | head -1", project_root, HIDDEN_TEST_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/home/user/project";

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn package_start_script_wins() {
        let set = files(&[
            ("package.json", r#"{"scripts":{"start":"x"}}"#),
            ("app.py", ""),
        ]);
        assert_eq!(detect_run_command(&set, ROOT), "cd /home/user/project && npm start");
    }

    #[test]
    fn package_dev_script_is_second_choice() {
        let set = files(&[("package.json", r#"{"scripts":{"dev":"vite"}}"#)]);
        assert_eq!(detect_run_command(&set, ROOT), "cd /home/user/project && npm run dev");
    }

    #[test]
    fn python_entry_file_is_run_with_interpreter() {
        let set = files(&[("app.py", "print(1)")]);
        assert_eq!(detect_run_command(&set, ROOT), "cd /home/user/project && python app.py");

        let set = files(&[("helpers.py", ""), ("main.py", ""), ("test_main.py", "")]);
        assert_eq!(detect_run_command(&set, ROOT), "cd /home/user/project && python main.py");
    }

    #[test]
    fn falls_back_to_first_source_of_language() {
        let set = files(&[("src/server.ts", ""), ("src/util.ts", "")]);
        assert_eq!(
            detect_run_command(&set, ROOT),
            "cd /home/user/project && npx tsx src/server.ts"
        );

        let set = files(&[("package.json", "not json"), ("index.js", "")]);
        assert_eq!(detect_run_command(&set, ROOT), "cd /home/user/project && node index.js");
    }

    #[test]
    fn nothing_runnable_is_a_no_op() {
        let set = files(&[("README.md", "")]);
        assert_eq!(
            detect_run_command(&set, ROOT),
            "cd /home/user/project && echo \"No runnable file detected\""
        );
    }

    #[test]
    fn test_command_follows_language() {
        let py = files(&[("app.py", "")]);
        assert_eq!(
            detect_test_command(&py, ROOT).unwrap(),
            "cd /home/user/project && python -m pytest .atrium_tests/ -v 2>&1"
        );
        let tsx = files(&[("App.tsx", "")]);
        assert_eq!(
            detect_test_command(&tsx, ROOT).unwrap(),
            "cd /home/user/project && npx jest --roots .atrium_tests/ 2>&1"
        );
        assert_eq!(detect_test_command(&files(&[("main.go", "")]), ROOT), None);
    }
}
