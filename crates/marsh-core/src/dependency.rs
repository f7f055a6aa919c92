//! Dependency specifications.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One requested or installed package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// Package name.
    pub name: String,
    /// Version, or version prefix when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Dependency {
    /// A dependency on any version of `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// Pin a version (prefix).
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Check whether `installed` fulfils this request.
    pub fn is_satisfied_by(&self, installed: &Dependency) -> bool {
        if self.name != installed.name {
            return false;
        }
        match (&self.version, &installed.version) {
            (None, _) => true,
            (Some(wanted), Some(have)) => have.starts_with(wanted.as_str()),
            (Some(_), None) => false,
        }
    }
}

impl FromStr for Dependency {
    type Err = String;

    /// Parse `name`, `name==version` or `channel::name==version`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = match s.rsplit_once("::") {
            Some((_, rest)) => rest,
            None => s,
        };
        let (name, version) = match s.split_once("==") {
            Some((name, version)) => (name.trim(), Some(version.trim())),
            None => (s, None),
        };
        if name.is_empty() {
            return Err(format!("invalid dependency: {s:?}"));
        }
        if version.is_some_and(str::is_empty) {
            return Err(format!("empty version in dependency: {s:?}"));
        }
        Ok(Self {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}=={}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The runtime and packages an environment needs (or has).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Runtime version (prefix), e.g. `3.12`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Packages.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl DependencySpec {
    /// An empty specification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a list of dependency strings.
    pub fn parse<I, S>(items: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let dependencies = items
            .into_iter()
            .map(|item| item.as_ref().parse())
            .collect::<Result<Vec<Dependency>, String>>()?;
        Ok(Self {
            runtime: None,
            dependencies,
        })
    }

    /// Set the runtime version.
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    /// Add a dependency.
    pub fn with(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// True when nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.runtime.is_none() && self.dependencies.is_empty()
    }

    /// Check whether `installed` fulfils every request in this spec.
    pub fn is_satisfied_by(&self, installed: &DependencySpec) -> bool {
        if let Some(wanted) = &self.runtime {
            match &installed.runtime {
                Some(have) if have.starts_with(wanted.as_str()) => {}
                _ => return false,
            }
        }
        self.dependencies.iter().all(|wanted| {
            installed
                .dependencies
                .iter()
                .any(|have| wanted.is_satisfied_by(have))
        })
    }

    /// This record updated with what `newer` installed.
    ///
    /// Packages in `newer` replace same-named entries; the others are kept.
    pub fn merged(&self, newer: &DependencySpec) -> DependencySpec {
        let mut dependencies: Vec<Dependency> = self
            .dependencies
            .iter()
            .filter(|old| newer.dependencies.iter().all(|new| new.name != old.name))
            .cloned()
            .collect();
        dependencies.extend(newer.dependencies.iter().cloned());
        DependencySpec {
            runtime: newer.runtime.clone().or_else(|| self.runtime.clone()),
            dependencies,
        }
    }

    /// Package list as passed to install commands (`a==1 b`).
    pub fn packages(&self) -> String {
        self.dependencies
            .iter()
            .map(Dependency::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!("numpy".parse::<Dependency>().unwrap(), Dependency::new("numpy"));
        assert_eq!(
            "numpy==1.26".parse::<Dependency>().unwrap(),
            Dependency::new("numpy").with_version("1.26")
        );
        assert_eq!(
            "conda-forge::numpy==1.26".parse::<Dependency>().unwrap(),
            Dependency::new("numpy").with_version("1.26")
        );
        assert!("".parse::<Dependency>().is_err());
        assert!("numpy==".parse::<Dependency>().is_err());
    }

    #[test]
    fn test_version_prefix_match() {
        let wanted = Dependency::new("numpy").with_version("1.26");
        assert!(wanted.is_satisfied_by(&Dependency::new("numpy").with_version("1.26.4")));
        assert!(!wanted.is_satisfied_by(&Dependency::new("numpy").with_version("2.0.0")));
        assert!(!wanted.is_satisfied_by(&Dependency::new("numpy")));
        assert!(Dependency::new("numpy").is_satisfied_by(&Dependency::new("numpy").with_version("2.0")));
    }

    #[test]
    fn test_spec_satisfaction() {
        let installed = DependencySpec::parse(["numpy==1.26.4", "pandas==2.2.0"])
            .unwrap()
            .with_runtime("3.12.1");

        assert!(DependencySpec::new().is_satisfied_by(&DependencySpec::new()));
        assert!(DependencySpec::parse(["numpy"]).unwrap().is_satisfied_by(&installed));
        assert!(DependencySpec::parse(["numpy==1.26"])
            .unwrap()
            .with_runtime("3.12")
            .is_satisfied_by(&installed));
        assert!(!DependencySpec::parse(["scipy"]).unwrap().is_satisfied_by(&installed));
        assert!(!DependencySpec::new()
            .with_runtime("3.11")
            .is_satisfied_by(&installed));
    }

    #[test]
    fn test_packages_and_json() {
        let spec = DependencySpec::parse(["a==1", "b"]).unwrap();
        assert_eq!(spec.packages(), "a==1 b");

        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"dependencies":[{"name":"a","version":"1"},{"name":"b"}]}"#);
        let back: DependencySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_merged_keeps_earlier_packages() {
        let installed = DependencySpec::parse(["numpy==1.26", "pandas==2.2"])
            .unwrap()
            .with_runtime("3.12");
        let merged = installed.merged(&DependencySpec::parse(["numpy==2.0", "scipy"]).unwrap());

        assert_eq!(merged.runtime.as_deref(), Some("3.12"));
        assert_eq!(merged.packages(), "pandas==2.2 numpy==2.0 scipy");
        assert!(DependencySpec::parse(["pandas", "scipy", "numpy==2"])
            .unwrap()
            .is_satisfied_by(&merged));
    }
}
