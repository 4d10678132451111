//! Heuristic dependency extraction from Nix expressions.
//!
//! Nix is a full functional language; a regex scanner cannot be complete.
//! Instead of guaranteeing correctness, this parser extracts what it can in
//! several passes (comment stripping, variable expansion, per-field
//! evaluation, conditional detection) and reports its own confidence as a
//! [`ParseQuality`] verdict plus human-readable warnings. It never fails:
//! unparseable input yields empty sets with quality `Low`.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Dependency-bearing attribute names recognized in a derivation.
const DEPENDENCY_FIELDS: [&str; 4] = [
    "buildInputs",
    "nativeBuildInputs",
    "propagatedBuildInputs",
    "checkInputs",
];

/// Nix keywords and operators that can appear inside list bodies.
const CONTROL_KEYWORDS: [&str; 9] = ["++", "||", "&&", "if", "then", "else", "let", "in", "with"];

/// Builtin identifiers that are never package names.
const NIX_BUILTINS: [&str; 5] = ["stdenv", "lib", "fetchurl", "fetchgit", "mkDerivation"];

static BLOCK_COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static VARIABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(\w+)\s*=\s*(?:with\s+[\w.]+;\s*)?\[(.*?)\];").unwrap());
static IMPORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"import\s+(\.[\w/.\-]+)").unwrap());
static CALL_PACKAGE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"callPackage\s+(\.[\w/.\-]+)").unwrap());
static CALL_PACKAGE_VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"callPackage\s+\w+").unwrap());
static IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+$").unwrap());
static LIST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[(.*?)\]").unwrap());
static WITH_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"with\s+[\w.]+;\s*").unwrap());
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static COND_OPTIONALS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"lib\.optionals?\s+([^\[]+)\[").unwrap());
static COND_IF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"if\s+([^\n]+)\s+then").unwrap());
static COND_PLATFORM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"stdenv\.is\w+").unwrap());
/// One field-extraction regex per recognized dependency attribute. The
/// optional `with <scope>;` prefix is absorbed into the capture so its `;`
/// does not terminate the match early.
static FIELD_RES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    DEPENDENCY_FIELDS
        .iter()
        .map(|field| {
            let re =
                Regex::new(&format!(r"(?s)\b{field}\s*=\s*((?:with\s+[\w.]+;\s*)?.*?);")).unwrap();
            (*field, re)
        })
        .collect()
});

/// Self-assessed confidence that the extracted dependency set is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParseQuality {
    /// All dependencies likely captured.
    High,
    /// Most dependencies captured, some may be missing.
    Medium,
    /// Partial capture, significant deps likely missing.
    Low,
    /// Cannot assess quality.
    Unknown,
}

impl ParseQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseQuality::High => "HIGH",
            ParseQuality::Medium => "MEDIUM",
            ParseQuality::Low => "LOW",
            ParseQuality::Unknown => "UNKNOWN",
        }
    }
}

/// Structured result of parsing one Nix expression.
///
/// The four dependency sets correspond to the recognized derivation
/// attributes. `variables`, `conditionals`, and `imports` carry context the
/// extraction discovered along the way; `parse_quality` and `warnings` are
/// derived during assessment and explain any downgrade.
#[derive(Debug, Clone, Serialize)]
pub struct NixDependencies {
    #[serde(rename = "buildInputs")]
    pub build_inputs: BTreeSet<String>,
    #[serde(rename = "nativeBuildInputs")]
    pub native_build_inputs: BTreeSet<String>,
    #[serde(rename = "propagatedBuildInputs")]
    pub propagated_build_inputs: BTreeSet<String>,
    #[serde(rename = "checkInputs")]
    pub check_inputs: BTreeSet<String>,

    pub variables: BTreeMap<String, BTreeSet<String>>,
    pub conditionals: Vec<String>,
    pub imports: Vec<String>,

    #[serde(rename = "parseQuality")]
    pub parse_quality: ParseQuality,
    pub warnings: Vec<String>,
}

impl Default for NixDependencies {
    fn default() -> Self {
        Self {
            build_inputs: BTreeSet::new(),
            native_build_inputs: BTreeSet::new(),
            propagated_build_inputs: BTreeSet::new(),
            check_inputs: BTreeSet::new(),
            variables: BTreeMap::new(),
            conditionals: Vec::new(),
            imports: Vec::new(),
            parse_quality: ParseQuality::Unknown,
            warnings: Vec::new(),
        }
    }
}

impl NixDependencies {
    /// Union of every dependency category.
    pub fn all_dependencies(&self) -> BTreeSet<String> {
        let mut all = BTreeSet::new();
        all.extend(self.build_inputs.iter().cloned());
        all.extend(self.native_build_inputs.iter().cloned());
        all.extend(self.propagated_build_inputs.iter().cloned());
        all.extend(self.check_inputs.iter().cloned());
        all
    }

    /// JSON representation used for cached source files and NPS metadata.
    ///
    /// Same shape as the serde derive, plus the derived `totalDependencies`
    /// count.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "totalDependencies".to_string(),
                serde_json::Value::from(self.all_dependencies().len()),
            );
        }
        value
    }
}

/// Parse Nix expression content and extract dependencies.
///
/// Total: returns a result for any input. `pkg_name` is used only for log
/// context.
pub fn parse_nix_dependencies(content: &str, pkg_name: Option<&str>) -> NixDependencies {
    let mut deps = NixDependencies::default();
    let mut warnings = Vec::new();

    let cleaned = strip_comments(content);

    deps.variables = extract_variables(&cleaned);
    deps.imports = extract_imports(&cleaned);

    for (field, re) in FIELD_RES.iter() {
        let Some(caps) = re.captures(&cleaned) else {
            continue;
        };
        let extracted = parse_expression(&caps[1], &deps.variables, &mut warnings);
        match *field {
            "buildInputs" => deps.build_inputs.extend(extracted),
            "nativeBuildInputs" => deps.native_build_inputs.extend(extracted),
            "propagatedBuildInputs" => deps.propagated_build_inputs.extend(extracted),
            "checkInputs" => deps.check_inputs.extend(extracted),
            _ => unreachable!("unknown dependency field"),
        }
    }

    deps.conditionals = detect_conditionals(&cleaned);
    deps.parse_quality = assess_quality(&deps, &cleaned, &mut warnings);
    deps.warnings = warnings;

    if let Some(name) = pkg_name {
        tracing::debug!(
            package = %name,
            deps = deps.all_dependencies().len(),
            quality = deps.parse_quality.as_str(),
            warnings = deps.warnings.len(),
            "Parsed Nix expression"
        );
    }

    deps
}

/// Remove block comments outright; strip trailing `#` comments only on lines
/// containing no quote character at all.
///
/// Deliberately conservative: a line with any quote is kept untouched so
/// string literals containing `#` are never corrupted, at the cost of leaving
/// some comments in place.
fn strip_comments(content: &str) -> String {
    let content = BLOCK_COMMENT_RE.replace_all(content, "");

    let mut lines = Vec::new();
    for line in content.lines() {
        if line.contains('"') || line.contains('\'') {
            lines.push(line.to_string());
        } else if let Some(pos) = line.find('#') {
            lines.push(line[..pos].to_string());
        } else {
            lines.push(line.to_string());
        }
    }
    lines.join("\n")
}

/// Extract `name = [ ... ];` bindings whose name is not itself a dependency
/// field, recording each as a resolvable variable.
fn extract_variables(content: &str) -> BTreeMap<String, BTreeSet<String>> {
    let mut variables = BTreeMap::new();

    for caps in VARIABLE_RE.captures_iter(content) {
        let name = &caps[1];
        if DEPENDENCY_FIELDS.contains(&name) {
            continue;
        }
        let tokens = tokenize_list(&caps[2]);
        if !tokens.is_empty() {
            tracing::trace!(variable = %name, count = tokens.len(), "Extracted variable binding");
            variables.insert(name.to_string(), tokens);
        }
    }

    variables
}

/// Collect references to external files: direct imports and
/// `callPackage ./path` loads. Their presence signals that the dependency
/// set may be incomplete, since resolving them is out of scope.
fn extract_imports(content: &str) -> Vec<String> {
    let mut imports = Vec::new();
    for caps in IMPORT_RE.captures_iter(content) {
        imports.push(caps[1].to_string());
    }
    for caps in CALL_PACKAGE_PATH_RE.captures_iter(content) {
        imports.push(caps[1].to_string());
    }
    imports
}

/// Evaluate one field assignment expression: split on `++`, then resolve each
/// part as a variable reference, a conditional inclusion, or a literal list.
fn parse_expression(
    expression: &str,
    variables: &BTreeMap<String, BTreeSet<String>>,
    warnings: &mut Vec<String>,
) -> BTreeSet<String> {
    let mut deps = BTreeSet::new();

    for part in expression.split("++") {
        let part = part.trim();

        if IDENT_RE.is_match(part) {
            if let Some(resolved) = variables.get(part) {
                deps.extend(resolved.iter().cloned());
                continue;
            }
        }

        if part.contains("lib.optional") {
            if let Some(caps) = LIST_RE.captures(part) {
                deps.extend(tokenize_list(&caps[1]));
                let head: String = part.chars().take(50).collect();
                warnings.push(format!("Conditional dependency found: {head}..."));
            }
            continue;
        }

        if let Some(caps) = LIST_RE.captures(part) {
            let body = if part.contains("with") {
                WITH_PREFIX_RE.replace_all(&caps[1], "").into_owned()
            } else {
                caps[1].to_string()
            };
            deps.extend(tokenize_list(&body));
        }
    }

    deps
}

/// Split a list body `[ foo bar "baz" pkgs.qux ]` into dependency names.
fn tokenize_list(body: &str) -> BTreeSet<String> {
    let mut deps = BTreeSet::new();
    let unquoted = body.replace(['"', '\''], " ");

    for token in unquoted.split_whitespace() {
        // String interpolation placeholders are not resolvable names.
        if token.starts_with("${") {
            continue;
        }
        if CONTROL_KEYWORDS.contains(&token) || NIX_BUILTINS.contains(&token) {
            continue;
        }

        // Collapse attribute paths: pkgs.foo -> foo
        let token = match token.rsplit_once('.') {
            Some((_, last)) => last,
            None => token,
        };
        let token = token.trim_matches(['"', ';', ',']);

        if token.len() > 1 && TOKEN_RE.is_match(token) {
            deps.insert(token.to_string());
        }
    }

    deps
}

/// Pattern-match common conditional-inclusion and platform-guard idioms
/// across the whole text, independent of per-field extraction.
fn detect_conditionals(content: &str) -> Vec<String> {
    let mut conditionals = Vec::new();

    for caps in COND_OPTIONALS_RE.captures_iter(content) {
        conditionals.push(caps[1].to_string());
    }
    for caps in COND_IF_RE.captures_iter(content) {
        conditionals.push(caps[1].to_string());
    }
    for m in COND_PLATFORM_RE.find_iter(content) {
        conditionals.push(m.as_str().to_string());
    }

    conditionals
}

/// Derive the quality verdict, in priority order:
///
/// 1. `callPackage <identifier>` — the loaded file cannot be located, let
///    alone resolved: Low.
/// 2. Any cross-file import — external dependencies may be missing: Medium.
/// 3. More than three detected conditionals: Medium.
/// 4. Zero extracted dependencies: Low.
/// 5. High if extraction recorded no warnings, Medium otherwise.
fn assess_quality(
    deps: &NixDependencies,
    content: &str,
    warnings: &mut Vec<String>,
) -> ParseQuality {
    if CALL_PACKAGE_VAR_RE.is_match(content) {
        warnings.push("callPackage with variable found - dependencies may be incomplete".into());
        return ParseQuality::Low;
    }

    if !deps.imports.is_empty() {
        warnings.push(format!(
            "Found {} imports - external dependencies may be missing",
            deps.imports.len()
        ));
        return ParseQuality::Medium;
    }

    if deps.conditionals.len() > 3 {
        warnings.push("Multiple conditionals found - some dependencies may be conditional".into());
        return ParseQuality::Medium;
    }

    if deps.all_dependencies().is_empty() {
        warnings.push("No dependencies found - may be incorrect or empty package".into());
        return ParseQuality::Low;
    }

    if warnings.is_empty() {
        ParseQuality::High
    } else {
        ParseQuality::Medium
    }
}
