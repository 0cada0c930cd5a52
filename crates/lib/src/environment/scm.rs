//! setuptools-scm pretend versions derived from revision names.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

const MAX_VERSION_PARTS: usize = 4;

const PREFIXES: [&str; 4] = ["version-", "release-", "rel-", "v"];

static VERSION: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
  Regex::new(r"(?i)^(\d+(?:\.\d+)*)(?:[-._]?(?:alpha|beta|rc|pre|post|dev)(?:\d+|\.?\d+)?)?(?:\+[a-z0-9._-]+)?$")
});

/// Version encoded in a tag or branch name, e.g. `v1.2.3` or `release-2.0rc1`.
///
/// One of the prefixes `version-`, `release-`, `rel-` or `v` is stripped
/// (case-insensitively). At most four numeric components are accepted.
pub fn extract_version_from_ref_name(name: &str) -> Option<String> {
  let cleaned = PREFIXES
    .iter()
    .find_map(|prefix| {
      let head = name.get(..prefix.len())?;
      head.eq_ignore_ascii_case(prefix).then(|| &name[prefix.len()..])
    })
    .unwrap_or(name);

  let pattern = VERSION.as_ref().ok()?;
  let caps = pattern.captures(cleaned)?;
  let numeric = caps.get(1)?.as_str();
  if numeric.split('.').count() > MAX_VERSION_PARTS {
    return None;
  }
  Some(cleaned.to_string())
}

/// Variables making setuptools-scm report the version of `name`.
///
/// Empty when the name carries no version. With a package name the
/// package-specific variable is used.
pub fn pretend_version_env(name: &str, package: Option<&str>) -> BTreeMap<String, String> {
  let Some(version) = extract_version_from_ref_name(name) else {
    return BTreeMap::new();
  };
  let key = match package {
    Some(package) => format!(
      "SETUPTOOLS_SCM_PRETEND_VERSION_FOR_{}",
      package.to_uppercase().replace(['-', '.'], "_")
    ),
    None => "SETUPTOOLS_SCM_PRETEND_VERSION".to_string(),
  };
  BTreeMap::from([(key, version)])
}
