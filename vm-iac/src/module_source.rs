//! Module source rewriting.
//!
//! Module registrations store a browsable repository URL. Terraform and
//! Terragrunt need the `git::` fetch form with an optional `?ref=` pin.

use url::Url;

const GIT_PREFIX: &str = "git::";

/// Rewrite a module source into its fetchable form.
///
/// `https://git.example.com/org/repo//modules/vm` with version `v1.2.0`
/// becomes `git::https://git.example.com/org/repo.git//modules/vm?ref=v1.2.0`.
/// Local paths and registry addresses are returned unchanged.
pub fn fetchable_source(source: &str, version: Option<&str>) -> String {
    let source = source.trim();
    if is_local_path(source) {
        return source.to_string();
    }

    let had_prefix = source.starts_with(GIT_PREFIX);
    let address = source.strip_prefix(GIT_PREFIX).unwrap_or(source);

    let Some(path_start) = repository_path_start(address) else {
        // Registry address (namespace/name/provider) or another getter.
        return source.to_string();
    };

    let (main, query) = match address.split_once('?') {
        Some((main, query)) => (main, Some(query)),
        None => (address, None),
    };

    let (repo, subdir) = match main[path_start..].find("//") {
        Some(idx) => (&main[..path_start + idx], Some(&main[path_start + idx + 2..])),
        None => (main, None),
    };

    let mut out = String::with_capacity(source.len() + 32);
    out.push_str(GIT_PREFIX);
    let repo = repo.trim_end_matches('/');
    out.push_str(repo);
    if !repo.ends_with(".git") {
        out.push_str(".git");
    }
    if let Some(subdir) = subdir.filter(|s| !s.is_empty()) {
        out.push_str("//");
        out.push_str(subdir);
    }

    let has_ref = query
        .map(|q| q.split('&').any(|pair| pair.starts_with("ref=")))
        .unwrap_or(false);
    let mut params: Vec<String> = query
        .filter(|q| !q.is_empty())
        .map(|q| vec![q.to_string()])
        .unwrap_or_default();
    if let Some(version) = version.map(str::trim).filter(|v| !v.is_empty()) {
        if !has_ref {
            params.push(format!("ref={version}"));
        }
    }
    if !params.is_empty() {
        out.push('?');
        out.push_str(&params.join("&"));
    }

    // Keep the caller's spelling when nothing needed adding.
    if had_prefix && out == source {
        return source.to_string();
    }
    out
}

/// Host serving a module source, used to scope fetch credentials.
pub fn source_host(source: &str) -> Option<String> {
    let address = source.trim();
    let address = address.strip_prefix(GIT_PREFIX).unwrap_or(address);
    if let Some(rest) = address.strip_prefix("git@") {
        return rest.split(':').next().map(str::to_string);
    }
    Url::parse(address)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

fn is_local_path(source: &str) -> bool {
    source.starts_with("./") || source.starts_with("../") || source.starts_with('/')
}

/// Byte offset of the repository path inside a VCS address, if it is one.
fn repository_path_start(address: &str) -> Option<usize> {
    for scheme in ["https://", "http://", "ssh://", "git://"] {
        if address.starts_with(scheme) {
            return Some(scheme.len());
        }
    }
    if address.starts_with("git@") {
        return Some("git@".len());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrites_https_source_with_version() {
        assert_eq!(
            fetchable_source("https://git.example.com/org/repo//modules/vm", Some("v1.2.0")),
            "git::https://git.example.com/org/repo.git//modules/vm?ref=v1.2.0"
        );
    }

    #[test]
    fn test_without_version_or_subdir() {
        assert_eq!(
            fetchable_source("https://git.example.com/org/repo", None),
            "git::https://git.example.com/org/repo.git"
        );
    }

    #[test]
    fn test_existing_prefix_suffix_and_ref_are_kept() {
        let source = "git::https://git.example.com/org/repo.git//modules/vm?ref=main";
        assert_eq!(fetchable_source(source, Some("v9.9.9")), source);
    }

    #[test]
    fn test_trailing_slash_after_git_suffix() {
        assert_eq!(
            fetchable_source("https://git.example.com/org/repo.git/", Some("v1")),
            "git::https://git.example.com/org/repo.git?ref=v1"
        );
        assert_eq!(
            fetchable_source("https://git.example.com/org/repo/", None),
            "git::https://git.example.com/org/repo.git"
        );
    }

    #[test]
    fn test_existing_query_gets_ref_appended() {
        assert_eq!(
            fetchable_source("https://git.example.com/org/repo//vm?depth=1", Some("v1")),
            "git::https://git.example.com/org/repo.git//vm?depth=1&ref=v1"
        );
    }

    #[test]
    fn test_scp_style_source() {
        assert_eq!(
            fetchable_source("git@git.example.com:org/repo//modules/vm", Some("v2")),
            "git::git@git.example.com:org/repo.git//modules/vm?ref=v2"
        );
    }

    #[test]
    fn test_local_and_registry_sources_untouched() {
        assert_eq!(fetchable_source("./modules/vm", Some("v1")), "./modules/vm");
        assert_eq!(
            fetchable_source("terraform-aws-modules/ec2-instance/aws", Some("5.0.0")),
            "terraform-aws-modules/ec2-instance/aws"
        );
    }

    #[test]
    fn test_source_host() {
        assert_eq!(
            source_host("https://git.example.com/org/repo//vm").as_deref(),
            Some("git.example.com")
        );
        assert_eq!(
            source_host("git@gitlab.local:org/repo").as_deref(),
            Some("gitlab.local")
        );
        assert_eq!(source_host("./modules/vm"), None);
    }
}
