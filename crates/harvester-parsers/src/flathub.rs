//! Flathub manifest discovery helpers.
//!
//! Each Flathub app lives in its own GitHub repository under the `flathub`
//! organization, with a Flatpak manifest at one of a few well-known
//! filenames. These helpers generate the candidate raw-content URLs and
//! derive a likely package name from the reverse-DNS application id.

/// GitHub organization hosting one repository per Flathub app.
pub const FLATHUB_ORG: &str = "flathub";

/// Standard manifest filenames, in priority order. `{app_id}` is substituted.
const MANIFEST_CANDIDATES: [&str; 6] = [
    "{app_id}.yml",
    "{app_id}.yaml",
    "{app_id}.json",
    "org.flatpak.Manifest.json",
    "manifest.json",
    "manifest.yml",
];

/// Candidate raw GitHub URLs for an app's manifest, in priority order.
pub fn manifest_urls(app_id: &str, branch: &str) -> Vec<String> {
    let base = format!("https://raw.githubusercontent.com/{FLATHUB_ORG}/{app_id}/{branch}");
    MANIFEST_CANDIDATES
        .iter()
        .map(|template| {
            let filename = template.replace("{app_id}", app_id);
            format!("{base}/{filename}")
        })
        .collect()
}

/// Extract a likely package name from a Flatpak application id.
///
/// `org.gnome.Calculator` -> `calculator`; ids with fewer than three
/// dot-segments carry no usable name.
pub fn extract_package_name(app_id: &str) -> Option<String> {
    let parts: Vec<&str> = app_id.split('.').collect();
    if parts.len() >= 3 {
        Some(parts[parts.len() - 1].to_lowercase())
    } else {
        None
    }
}
