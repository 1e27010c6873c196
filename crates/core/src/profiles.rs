use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PROFILE: &str = "node";
pub const ALL_PROFILE: &str = "all";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub description: String,
    pub targets: Vec<String>,
}

const BUILTIN: &[(&str, &str, &[&str])] = &[
    (
        "node",
        "JavaScript and web toolchain output: dependencies, bundler caches, framework build folders and coverage reports.",
        &[
            "node_modules",
            ".npm",
            ".pnpm-store",
            ".next",
            ".nuxt",
            ".angular",
            ".svelte-kit",
            ".vite",
            ".nx",
            ".turbo",
            ".parcel-cache",
            ".rpt2_cache",
            ".eslintcache",
            ".esbuild",
            ".cache",
            ".rollup.cache",
            "storybook-static",
            "coverage",
            ".nyc_output",
            ".jest",
            "gatsby_cache",
            ".docusaurus",
            ".swc",
            ".stylelintcache",
            "deno_cache",
        ],
    ),
    (
        "python",
        "Python bytecode, tool caches, virtual environments and test artifacts.",
        &[
            "__pycache__",
            ".pytest_cache",
            ".mypy_cache",
            ".ruff_cache",
            ".tox",
            ".nox",
            ".pytype",
            ".pyre",
            "htmlcov",
            ".venv",
            "venv",
        ],
    ),
    (
        "data-science",
        "Notebook checkpoints, virtual environments, experiment runs and outputs.",
        &[
            ".ipynb_checkpoints",
            "__pycache__",
            ".venv",
            "venv",
            "outputs",
            ".dvc",
            ".mlruns",
        ],
    ),
    ("java", "Maven and Gradle build output.", &["target", ".gradle", "out"]),
    (
        "android",
        "Native build caches from Android Studio projects.",
        &[".cxx", "externalNativeBuild"],
    ),
    (
        "swift",
        "Xcode derived data and Swift package builds.",
        &["DerivedData", ".swiftpm"],
    ),
    (
        "dotnet",
        "Compilation output, test results and Visual Studio caches.",
        &["obj", "TestResults", ".vs"],
    ),
    ("rust", "Cargo build targets.", &["target"]),
    ("ruby", "Bundler caches.", &[".bundle"]),
    (
        "elixir",
        "Mix builds, fetched dependencies and coverage reports.",
        &["_build", "deps", "cover"],
    ),
    (
        "haskell",
        "Cabal and Stack build output.",
        &["dist-newstyle", ".stack-work"],
    ),
    (
        "scala",
        "Bloop and Metals state plus sbt build output.",
        &[".bloop", ".metals", "target"],
    ),
    (
        "cpp",
        "CMake build trees.",
        &["CMakeFiles", "cmake-build-debug", "cmake-build-release"],
    ),
    (
        "unity",
        "Unity editor caches and build artifacts.",
        &["Library", "Temp", "Obj"],
    ),
    (
        "unreal",
        "Unreal intermediate and binary build caches.",
        &["Intermediate", "DerivedDataCache", "Binaries"],
    ),
    (
        "godot",
        "Godot editor caches and import data.",
        &[".import", ".godot"],
    ),
    (
        "infra",
        "Leftovers from deployment and tooling such as Serverless, Vercel, Netlify and Terraform.",
        &[
            ".serverless",
            ".vercel",
            ".netlify",
            ".terraform",
            ".sass-cache",
            ".cpcache",
            "elm_stuff",
            "nimcache",
            "deno_cache",
        ],
    ),
];

static BUILTIN_PROFILES: Lazy<BTreeMap<String, Profile>> = Lazy::new(|| {
    let mut profiles = BTreeMap::new();
    let mut union = Vec::new();
    let mut seen = HashSet::new();

    for (name, description, targets) in BUILTIN {
        for target in *targets {
            if seen.insert(*target) {
                union.push(target.to_string());
            }
        }
        profiles.insert(
            name.to_string(),
            Profile {
                description: description.to_string(),
                targets: targets.iter().map(|target| target.to_string()).collect(),
            },
        );
    }

    profiles.insert(
        ALL_PROFILE.to_string(),
        Profile {
            description: "Every target from every built-in profile. Mixes unrelated ecosystems; review results before deleting.".to_string(),
            targets: union,
        },
    );
    profiles
});

pub fn builtin_profiles() -> &'static BTreeMap<String, Profile> {
    &BUILTIN_PROFILES
}

/// Built-in profiles plus user-defined ones from the rc file. A user profile
/// with a built-in name replaces it.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self {
            profiles: builtin_profiles().clone(),
        }
    }
}

impl ProfileRegistry {
    pub fn with_user_profiles(user: BTreeMap<String, Profile>) -> Self {
        let mut registry = Self::default();
        registry.profiles.extend(user);
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Profile)> {
        self.profiles
            .iter()
            .map(|(name, profile)| (name.as_str(), profile))
    }

    /// Ordered, de-duplicated union of the targets of `names`.
    pub fn targets_for(&self, names: &[String]) -> Result<Vec<String>, ConfigError> {
        let mut targets = Vec::new();
        let mut seen = HashSet::new();
        for name in names {
            let profile = self
                .get(name)
                .ok_or_else(|| ConfigError::UnknownProfile(name.clone()))?;
            for target in &profile.targets {
                if seen.insert(target.as_str()) {
                    targets.push(target.clone());
                }
            }
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn builtins_include_every_ecosystem_and_the_union() {
        let profiles = builtin_profiles();
        assert_eq!(profiles.len(), BUILTIN.len() + 1);
        assert_eq!(profiles[DEFAULT_PROFILE].targets[0], "node_modules");

        let all = &profiles[ALL_PROFILE].targets;
        for (_, profile) in profiles.iter().filter(|(name, _)| *name != ALL_PROFILE) {
            for target in &profile.targets {
                assert!(all.contains(target), "{target} missing from all");
            }
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn targets_for_merges_in_order_without_duplicates() {
        let registry = ProfileRegistry::default();
        let targets = registry
            .targets_for(&names(&["rust", "java", "python"]))
            .unwrap();
        assert_eq!(&targets[..3], &["target", ".gradle", "out"]);
        assert_eq!(targets.iter().filter(|t| *t == "target").count(), 1);
        assert!(targets.contains(&"__pycache__".to_string()));
    }

    #[test]
    fn unknown_profiles_are_errors() {
        let registry = ProfileRegistry::default();
        let err = registry.targets_for(&names(&["node", "cobol"])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProfile(name) if name == "cobol"));
    }

    #[test]
    fn user_profiles_override_builtins() {
        let mut user = BTreeMap::new();
        user.insert(
            "rust".to_string(),
            Profile {
                description: "only release builds".to_string(),
                targets: names(&["release"]),
            },
        );
        user.insert(
            "web".to_string(),
            Profile {
                description: "bundles".to_string(),
                targets: names(&["bundle"]),
            },
        );
        let registry = ProfileRegistry::with_user_profiles(user);
        assert_eq!(registry.get("rust").unwrap().targets, names(&["release"]));
        assert_eq!(
            registry.targets_for(&names(&["web"])).unwrap(),
            names(&["bundle"])
        );
        assert!(registry.get("node").is_some());
    }
}
