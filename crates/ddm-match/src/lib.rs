//! Text and category comparison primitives for demand deduplication.

use std::collections::BTreeSet;

use ddm_core::{CategoryAttributes, DemandHints, REMOTE_CITY};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "ddm-match";

/// Whitespace plus every Unicode punctuation class.
static STRIP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s\p{P}]+").expect("valid regex"));

/// Canonicalize text for comparison: simple lowercase, then strip all
/// whitespace and punctuation. Both sides of every text comparison must go
/// through this function.
pub fn normalize_text(input: &str) -> String {
    let lowered = input.to_lowercase();
    STRIP_RE.replace_all(&lowered, "").into_owned()
}

/// Similarity in [0, 1] between two free-text strings.
///
/// Identical normalized strings score 1; containment scores the length
/// ratio; everything else falls back to LCS length over the longer length.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_text(a);
    let nb = normalize_text(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }

    let ca: Vec<char> = na.chars().collect();
    let cb: Vec<char> = nb.chars().collect();

    // Containment shortcut: same sentence plus extra prefix/suffix.
    if na.contains(&nb) || nb.contains(&na) {
        let shorter = ca.len().min(cb.len());
        let longer = ca.len().max(cb.len());
        return shorter as f64 / longer as f64;
    }

    let lcs = lcs_len(&ca, &cb);
    lcs as f64 / ca.len().max(cb.len()) as f64
}

/// Classic longest-common-subsequence length with a rolling two-row table.
fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for &ch_a in a {
        for (j, &ch_b) in b.iter().enumerate() {
            curr[j + 1] = if ch_a == ch_b {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Uppercase a module code and unify slash-style spellings (`FI/CO` → `FICO`).
pub fn normalize_module_code(raw: &str) -> String {
    raw.trim()
        .to_uppercase()
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '／') && !c.is_whitespace())
        .collect()
}

/// Trim a city string and collapse working-from-home folk terms onto the
/// canonical remote token.
pub fn normalize_city(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed == "在家"
        || trimmed == "居家"
        || trimmed == "线上"
        || trimmed.eq_ignore_ascii_case("remote")
    {
        return REMOTE_CITY.to_string();
    }
    trimmed.to_string()
}

fn normalize_modules<I, S>(codes: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    codes
        .into_iter()
        .map(|c| normalize_module_code(c.as_ref()))
        .filter(|c| !c.is_empty())
        .collect()
}

/// Derive category attributes from a posting's submitter-supplied hints.
pub fn extract_from_hints(hints: &DemandHints) -> CategoryAttributes {
    CategoryAttributes {
        module_codes: normalize_modules(&hints.module_codes),
        city: normalize_city(&hints.city),
        is_remote: hints.is_remote,
        duration_text: hints.duration_text.trim().to_string(),
        years_text: hints.years_text.trim().to_string(),
        language: hints.language.trim().to_string(),
        cooperation_mode: hints.cooperation_mode.trim().to_string(),
        work_mode: hints.work_mode.trim().to_string(),
        consultant_level: hints.consultant_level.trim().to_string(),
        project_cycle: hints.project_cycle.trim().to_string(),
        time_requirement: hints.time_requirement.trim().to_string(),
    }
}

/// Derive category attributes from a canonical record's serialized
/// attribute bag. The bag is loosely typed; parse defensively and treat
/// anything unexpected as absent.
pub fn extract_from_attributes_json(value: &JsonValue) -> CategoryAttributes {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return CategoryAttributes::default(),
    };

    let module_codes = match obj.get("module_codes") {
        Some(JsonValue::Array(items)) => {
            normalize_modules(items.iter().filter_map(|v| v.as_str()))
        }
        Some(JsonValue::String(joined)) => normalize_modules(joined.split(',')),
        _ => BTreeSet::new(),
    };

    let str_field = |key: &str| -> String {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    CategoryAttributes {
        module_codes,
        city: normalize_city(&str_field("city")),
        is_remote: obj.get("is_remote").and_then(|v| v.as_bool()),
        duration_text: str_field("duration_text"),
        years_text: str_field("years_text"),
        language: str_field("language"),
        cooperation_mode: str_field("cooperation_mode"),
        work_mode: str_field("work_mode"),
        consultant_level: str_field("consultant_level"),
        project_cycle: str_field("project_cycle"),
        time_requirement: str_field("time_requirement"),
    }
}

/// Serialize attributes for storage on a canonical record, in the shape
/// `extract_from_attributes_json` reads back.
pub fn attributes_to_json(attrs: &CategoryAttributes) -> JsonValue {
    serde_json::to_value(attrs).unwrap_or(JsonValue::Null)
}

/// Coarse quality signal: fraction of category attributes present.
pub fn richness_score(attrs: &CategoryAttributes) -> f64 {
    attrs.filled_count() as f64 / CategoryAttributes::FIELD_COUNT as f64
}

const WEIGHT_MODULES: f64 = 3.0;
const WEIGHT_CITY: f64 = 2.0;
const WEIGHT_REMOTE: f64 = 2.0;
const WEIGHT_UNIT: f64 = 1.0;

/// Similarity in [0, 1] between two attribute records.
///
/// Hard vetoes short-circuit to 0: module presence must agree, module sets
/// must overlap, and non-empty cities must match. Past the vetoes the score
/// is a weighted average over the attributes present on both sides; absent
/// attributes are excluded from the denominator rather than penalized.
pub fn category_similarity(a: &CategoryAttributes, b: &CategoryAttributes) -> f64 {
    if a.module_codes.is_empty() != b.module_codes.is_empty() {
        return 0.0;
    }

    let module_overlap = if a.module_codes.is_empty() {
        None
    } else {
        let shared = a.module_codes.intersection(&b.module_codes).count();
        if shared == 0 {
            return 0.0;
        }
        let smaller = a.module_codes.len().min(b.module_codes.len());
        Some(shared as f64 / smaller as f64)
    };

    if !a.city.is_empty() && !b.city.is_empty() && a.city != b.city {
        return 0.0;
    }

    let mut score = 0.0;
    let mut weight = 0.0;

    if let Some(overlap) = module_overlap {
        score += WEIGHT_MODULES * overlap;
        weight += WEIGHT_MODULES;
    }
    if !a.city.is_empty() && !b.city.is_empty() {
        // City inequality vetoed above, so this is always a full match.
        score += WEIGHT_CITY;
        weight += WEIGHT_CITY;
    }
    if let (Some(ra), Some(rb)) = (a.is_remote, b.is_remote) {
        if ra == rb {
            score += WEIGHT_REMOTE;
        }
        weight += WEIGHT_REMOTE;
    }

    let soft_pairs = [
        (&a.cooperation_mode, &b.cooperation_mode),
        (&a.work_mode, &b.work_mode),
        (&a.consultant_level, &b.consultant_level),
        (&a.project_cycle, &b.project_cycle),
        (&a.language, &b.language),
        (&a.time_requirement, &b.time_requirement),
        (&a.duration_text, &b.duration_text),
        (&a.years_text, &b.years_text),
    ];
    for (va, vb) in soft_pairs {
        if va.is_empty() || vb.is_empty() {
            continue;
        }
        if va == vb {
            score += WEIGHT_UNIT;
        }
        weight += WEIGHT_UNIT;
    }

    if weight == 0.0 {
        return 0.0;
    }
    score / weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_strips_whitespace_and_punctuation() {
        assert_eq!(normalize_text("  FICO, Consultant!  "), "ficoconsultant");
        assert_eq!(normalize_text("【FICO】上海，5年"), "fico上海5年");
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text(" ,.!？ "), "");
    }

    #[test]
    fn similarity_identity_and_empty() {
        assert_eq!(text_similarity("FICO 顾问 上海", "FICO 顾问 上海"), 1.0);
        assert_eq!(text_similarity("anything", ""), 0.0);
        assert_eq!(text_similarity("", "anything"), 0.0);
        // Punctuation-only input normalizes to empty.
        assert_eq!(text_similarity("...", "..."), 0.0);
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = "FICO consultant needed in Shanghai, 5 years";
        let b = "Need FICO consultant, Shanghai, 5+ years experience";
        assert_eq!(text_similarity(a, b), text_similarity(b, a));
    }

    #[test]
    fn containment_scores_length_ratio() {
        let a = "FICO consultant Shanghai";
        let b = "FICO consultant Shanghai, urgent start";
        let na = normalize_text(a);
        let nb = normalize_text(b);
        let expected = na.chars().count() as f64 / nb.chars().count() as f64;
        assert_eq!(text_similarity(a, b), expected);
    }

    #[test]
    fn lcs_handles_divergent_strings() {
        // "abcde" vs "ace": LCS = 3, max len = 5.
        assert_eq!(text_similarity("a b c d e", "a c e"), 3.0 / 5.0);
        assert_eq!(lcs_len(&['x'], &['y']), 0);
    }

    #[test]
    fn module_code_normalization_unifies_slashes() {
        assert_eq!(normalize_module_code("FI/CO"), "FICO");
        assert_eq!(normalize_module_code("fi co"), "FICO");
        assert_eq!(normalize_module_code("  mm "), "MM");
    }

    #[test]
    fn city_normalization_maps_home_terms_to_remote() {
        assert_eq!(normalize_city("在家"), REMOTE_CITY);
        assert_eq!(normalize_city("居家"), REMOTE_CITY);
        assert_eq!(normalize_city("线上"), REMOTE_CITY);
        assert_eq!(normalize_city("Remote"), REMOTE_CITY);
        assert_eq!(normalize_city(" 上海 "), "上海");
    }

    #[test]
    fn attributes_json_round_trips_through_extractor() {
        let attrs = extract_from_hints(&DemandHints {
            module_codes: vec!["FI/CO".into(), "mm".into()],
            city: "在家".into(),
            is_remote: Some(true),
            years_text: " 5年以上 ".into(),
            ..Default::default()
        });
        assert!(attrs.module_codes.contains("FICO"));
        assert!(attrs.module_codes.contains("MM"));
        assert_eq!(attrs.city, REMOTE_CITY);
        assert_eq!(attrs.years_text, "5年以上");

        let json = attributes_to_json(&attrs);
        assert_eq!(extract_from_attributes_json(&json), attrs);
    }

    #[test]
    fn attributes_json_parses_loose_shapes() {
        let bag = json!({
            "module_codes": "FI/CO, SD",
            "city": "北京",
            "is_remote": false,
            "language": "英语流利",
            "unexpected": {"nested": true},
        });
        let attrs = extract_from_attributes_json(&bag);
        assert!(attrs.module_codes.contains("FICO"));
        assert!(attrs.module_codes.contains("SD"));
        assert_eq!(attrs.city, "北京");
        assert_eq!(attrs.is_remote, Some(false));
        assert_eq!(attrs.language, "英语流利");

        assert_eq!(
            extract_from_attributes_json(&JsonValue::Null),
            CategoryAttributes::default()
        );
    }

    fn attrs(modules: &[&str], city: &str) -> CategoryAttributes {
        CategoryAttributes {
            module_codes: modules.iter().map(|m| m.to_string()).collect(),
            city: city.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn module_presence_disagreement_vetoes() {
        let a = attrs(&["FICO"], "上海");
        let mut b = attrs(&[], "上海");
        b.language = "英语流利".into();
        assert_eq!(category_similarity(&a, &b), 0.0);
    }

    #[test]
    fn disjoint_modules_veto() {
        let a = attrs(&["FICO"], "");
        let b = attrs(&["MM"], "");
        assert_eq!(category_similarity(&a, &b), 0.0);
    }

    #[test]
    fn differing_cities_veto_despite_matching_modules() {
        let a = attrs(&["FICO"], "上海");
        let b = attrs(&["FICO"], "北京");
        assert_eq!(category_similarity(&a, &b), 0.0);
    }

    #[test]
    fn weighted_average_excludes_absent_attributes() {
        let mut a = attrs(&["FICO"], "上海");
        let mut b = attrs(&["FICO"], "上海");
        a.years_text = "5年".into();
        b.years_text = "8年".into();
        // modules 3*1 + city 2*1 + years 1*0 over weight 6.
        assert!((category_similarity(&a, &b) - 5.0 / 6.0).abs() < 1e-9);

        // Dropping the years mismatch from one side removes it from the
        // denominator entirely.
        b.years_text.clear();
        assert_eq!(category_similarity(&a, &b), 1.0);
    }

    #[test]
    fn partial_module_overlap_scales_by_smaller_set() {
        let a = attrs(&["FICO", "MM", "SD"], "");
        let b = attrs(&["FICO", "PP"], "");
        // overlap 1 / min(3, 2) = 0.5; only modules comparable.
        assert!((category_similarity(&a, &b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn no_comparable_attributes_scores_zero() {
        let a = CategoryAttributes::default();
        let b = CategoryAttributes::default();
        assert_eq!(category_similarity(&a, &b), 0.0);
    }

    #[test]
    fn richness_counts_filled_fraction() {
        let mut a = attrs(&["FICO"], "上海");
        a.years_text = "5年".into();
        assert!((richness_score(&a) - 3.0 / 11.0).abs() < 1e-9);
        assert_eq!(richness_score(&CategoryAttributes::default()), 0.0);
    }
}
