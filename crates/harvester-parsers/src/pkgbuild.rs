//! AUR PKGBUILD field extraction.
//!
//! PKGBUILDs are bash scripts; this is a straight-line regex lookup of the
//! scalar and array fields we care about, not a shell evaluator.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static DEPENDS_RE: Lazy<Regex> = Lazy::new(|| array_re("depends"));
static MAKEDEPENDS_RE: Lazy<Regex> = Lazy::new(|| array_re("makedepends"));
static OPTDEPENDS_RE: Lazy<Regex> = Lazy::new(|| array_re("optdepends"));
static PKGNAME_RE: Lazy<Regex> = Lazy::new(|| var_re("pkgname"));
static PKGVER_RE: Lazy<Regex> = Lazy::new(|| var_re("pkgver"));
static PKGDESC_RE: Lazy<Regex> = Lazy::new(|| var_re("pkgdesc"));

fn var_re(name: &str) -> Regex {
    Regex::new(&format!(r#"{name}=["']?([^"')\n]+)["']?"#)).unwrap()
}

fn array_re(name: &str) -> Regex {
    Regex::new(&format!(r"(?s)\b{name}=\((.*?)\)")).unwrap()
}

/// Metadata extracted from one PKGBUILD.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PkgBuild {
    pub pkgname: Option<String>,
    pub pkgver: Option<String>,
    pub pkgdesc: Option<String>,
    pub depends: Vec<String>,
    pub makedepends: Vec<String>,
    pub optdepends: Vec<String>,
}

/// Parse PKGBUILD content and extract package metadata.
pub fn parse_pkgbuild(content: &str) -> PkgBuild {
    PkgBuild {
        pkgname: extract_var(&PKGNAME_RE, content),
        pkgver: extract_var(&PKGVER_RE, content),
        pkgdesc: extract_var(&PKGDESC_RE, content),
        depends: extract_array(&DEPENDS_RE, content),
        makedepends: extract_array(&MAKEDEPENDS_RE, content),
        optdepends: extract_array(&OPTDEPENDS_RE, content),
    }
}

fn extract_var(re: &Regex, content: &str) -> Option<String> {
    re.captures(content)
        .map(|caps| caps[1].trim().to_string())
}

/// Extract a bash array like `depends=('foo>=1.0' 'bar' "baz")`, returning
/// cleaned names with version constraints stripped.
fn extract_array(re: &Regex, content: &str) -> Vec<String> {
    let Some(caps) = re.captures(content) else {
        return Vec::new();
    };

    let mut items = Vec::new();
    for item in caps[1].split_whitespace() {
        let item = item.trim_matches(['\'', '"']);
        if item.is_empty() {
            continue;
        }
        // foo>=1.0 -> foo
        let name = item
            .split(['>', '<', '='])
            .next()
            .unwrap_or_default();
        if !name.is_empty() {
            items.push(name.to_string());
        }
    }

    items
}
