use std::sync::LazyLock;

use regex::Regex;

/// Pathology case filenames look like `AP2300123B1.svs`: a two-letter
/// system prefix, a 6-12 digit accession number, and an optional slide
/// label (letter plus digits). `PA` is a legacy alias for `AP`.
static CASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(AP|PA|IM)(\d{6,12})([A-Z]\d*)?(?:\.[A-Za-z0-9]+)?$").expect("case regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseRef {
    /// Normalised case number, e.g. `AP2300123`.
    pub case_base: String,
    /// Slide label within the case; defaults to `"1"` when absent.
    pub label: String,
    /// Identifier in the external case system, e.g. `pathoweb:AP2300123`.
    pub external_case_id: String,
}

/// Parse external case identity out of a slide filename. Returns `None`
/// for filenames that do not follow the case convention.
pub fn parse_case_filename(name: &str) -> Option<CaseRef> {
    let caps = CASE_RE.captures(name)?;

    let prefix = match &caps[1] {
        "PA" => "AP",
        other => other,
    };
    let case_base = format!("{}{}", prefix, &caps[2]);
    let label = caps
        .get(3)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "1".to_string());
    let external_case_id = format!("pathoweb:{}", case_base);

    Some(CaseRef {
        case_base,
        label,
        external_case_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ap_with_label() {
        let r = parse_case_filename("AP2300123B1.svs").unwrap();
        assert_eq!(r.case_base, "AP2300123");
        assert_eq!(r.label, "B1");
        assert_eq!(r.external_case_id, "pathoweb:AP2300123");
    }

    #[test]
    fn pa_normalises_to_ap() {
        let r = parse_case_filename("PA2300123.svs").unwrap();
        assert_eq!(r.case_base, "AP2300123");
        assert_eq!(r.external_case_id, "pathoweb:AP2300123");
    }

    #[test]
    fn missing_label_defaults_to_one() {
        let r = parse_case_filename("IM123456").unwrap();
        assert_eq!(r.case_base, "IM123456");
        assert_eq!(r.label, "1");
    }

    #[test]
    fn label_letter_without_digits() {
        let r = parse_case_filename("AP20230001234A.ndpi").unwrap();
        assert_eq!(r.label, "A");
    }

    #[test]
    fn rejects_non_case_names() {
        assert!(parse_case_filename("sample.jpg").is_none());
        assert!(parse_case_filename("AP12345.svs").is_none()); // too few digits
        assert!(parse_case_filename("AP1234567890123.svs").is_none()); // too many
        assert!(parse_case_filename("XX2300123.svs").is_none());
        assert!(parse_case_filename("AP2300123B1.svs.bak.old").is_none());
    }
}
